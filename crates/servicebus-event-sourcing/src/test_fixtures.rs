//! A small bank account aggregate shared by this crate's tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use servicebus_core::identity::AggregateId;
use servicebus_core::message::{Message, MessageContract, MessageKind};

use crate::aggregate::{Aggregate, AggregateEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub account_id: String,
    pub amount: i64,
}

impl MessageContract for Deposited {
    const MESSAGE_TYPE: &'static str = "bank.deposited";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub account_id: String,
    pub amount: i64,
}

impl MessageContract for Withdrawn {
    const MESSAGE_TYPE: &'static str = "bank.withdrawn";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

impl AggregateEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Deposited(_) => Deposited::MESSAGE_TYPE,
            Self::Withdrawn(_) => Withdrawn::MESSAGE_TYPE,
        }
    }

    fn to_message(&self) -> Arc<dyn Message> {
        match self {
            Self::Deposited(e) => Arc::new(e.clone()),
            Self::Withdrawn(e) => Arc::new(e.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
    pub operations: u32,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
    type Event = AccountEvent;

    fn initial(_id: &AggregateId) -> Self {
        Self::default()
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Deposited(e) => self.balance += e.amount,
            AccountEvent::Withdrawn(e) => self.balance -= e.amount,
        }
        self.operations += 1;
    }
}

pub fn account_id(value: &str) -> AggregateId {
    AggregateId::new(Account::AGGREGATE_TYPE, value).unwrap()
}

pub fn deposited(account_id: &str, amount: i64) -> AccountEvent {
    AccountEvent::Deposited(Deposited {
        account_id: account_id.to_owned(),
        amount,
    })
}

pub fn withdrawn(account_id: &str, amount: i64) -> AccountEvent {
    AccountEvent::Withdrawn(Withdrawn {
        account_id: account_id.to_owned(),
        amount,
    })
}
