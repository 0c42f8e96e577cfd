//! Order management: grid order records and the level state machine

pub mod engine;
pub mod types;

pub use engine::GridEngine;
pub use types::{
    next_client_id, ClientOrderId, Command, OrderRecord, OrderRequest, OrderStatus,
};
