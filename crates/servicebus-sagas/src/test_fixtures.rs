//! An order fulfillment saga and a customer onboarding saga used by this
//! crate's tests.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::message::{MessageContract, MessageKind};
use servicebus_core::time::RelativeOffset;

use crate::definition::{Saga, SagaDefinition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: String,
    pub amount: i64,
}

impl MessageContract for PlaceOrder {
    const MESSAGE_TYPE: &'static str = "shop.place_order";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayment {
    pub order_id: String,
    pub amount: i64,
}

impl MessageContract for RequestPayment {
    const MESSAGE_TYPE: &'static str = "shop.request_payment";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub order_id: String,
}

impl MessageContract for PaymentReceived {
    const MESSAGE_TYPE: &'static str = "shop.payment_received";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDeclined {
    pub order: String,
    pub reason: String,
}

impl MessageContract for PaymentDeclined {
    const MESSAGE_TYPE: &'static str = "shop.payment_declined";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: String,
}

impl MessageContract for ShipOrder {
    const MESSAGE_TYPE: &'static str = "shop.ship_order";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl MessageContract for OrderShipped {
    const MESSAGE_TYPE: &'static str = "shop.order_shipped";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFulfillment {
    pub order_id: String,
    pub amount: i64,
    pub paid: bool,
}

impl Saga for OrderFulfillment {
    const SAGA_TYPE: &'static str = "order_fulfillment";

    fn definition() -> SagaDefinition<Self> {
        SagaDefinition::new("order_id")
            .expire_after(RelativeOffset::from_seconds(3_600))
            .started_by::<PlaceOrder, _>(|command, ctx| {
                ctx.fire(RequestPayment {
                    order_id: command.order_id.clone(),
                    amount: command.amount,
                });
                Ok(Self {
                    order_id: command.order_id.clone(),
                    amount: command.amount,
                    paid: false,
                })
            })
            .on::<PaymentReceived, _>(|saga, event, ctx| {
                saga.paid = true;
                ctx.fire(ShipOrder {
                    order_id: event.order_id.clone(),
                });
                Ok(())
            })
            .on::<PaymentDeclined, _>(|_saga, event, ctx| {
                ctx.fail(format!("payment declined: {}", event.reason));
                Ok(())
            })
            .identify::<PaymentDeclined, _>(|event| event.order.clone())
            .on::<OrderShipped, _>(|_saga, _event, ctx| {
                ctx.complete();
                Ok(())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRegistered {
    pub customer_id: String,
}

impl MessageContract for CustomerRegistered {
    const MESSAGE_TYPE: &'static str = "crm.customer_registered";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendWelcome {
    pub customer_id: String,
}

impl MessageContract for SendWelcome {
    const MESSAGE_TYPE: &'static str = "crm.send_welcome";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Onboarding {
    pub customer_id: String,
    pub registrations: u32,
}

impl Saga for Onboarding {
    const SAGA_TYPE: &'static str = "onboarding";

    fn definition() -> SagaDefinition<Self> {
        SagaDefinition::new("customer_id")
            .started_by::<CustomerRegistered, _>(|event, ctx| {
                ctx.fire(SendWelcome {
                    customer_id: event.customer_id.clone(),
                });
                Ok(Self {
                    customer_id: event.customer_id.clone(),
                    registrations: 1,
                })
            })
            .on::<CustomerRegistered, _>(|saga, _event, _ctx| {
                saga.registrations += 1;
                Ok(())
            })
    }
}

pub fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
}

pub fn place_order(order_id: &str) -> PlaceOrder {
    PlaceOrder {
        order_id: order_id.to_owned(),
        amount: 250,
    }
}
