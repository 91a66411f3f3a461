//! Message and header types shared by consumers, producers and brokers

pub mod message;
pub mod properties;

pub use message::{
    MessageEnvelope, MessageStoreRecord, OutgoingMessage, RawMessage, UNAVAILABLE_MESSAGE_ID,
};
pub use properties::{names, MessageProperties};
