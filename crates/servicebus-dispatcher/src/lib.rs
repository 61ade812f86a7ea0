//! Message dispatch for the service bus kernel.
//!
//! Handlers are collected into a [`HandlerRegistry`](registry::HandlerRegistry)
//! that is validated once, before the first message is dispatched: every
//! command the service accepts must have exactly one handler. The
//! [`MessageBus`](bus::MessageBus) then runs each resolved handler through
//! the validation, execution and outbound stages.

pub mod attempt;
pub mod bus;
pub mod registry;
