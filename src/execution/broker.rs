//! Broker/exchange boundary.
//!
//! The engine only ever talks to `BrokerConnector`: order placement and
//! cancellation are request/response, fills stream back asynchronously as
//! `FillEvent`s on a channel the connector is handed at startup. The fill
//! channel is at-least-once; consumers dedup by sequence number.
//!
//! Order ids are assigned by the caller, not the broker, so an order can be
//! on the local book before the placement round trip completes and fills
//! arriving out of order with the ack still find their order.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::portfolio::Side;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("order rejected by broker: {0}")]
    Rejected(String),
    #[error("unknown order id {0}")]
    UnknownOrder(String),
    #[error("broker transport failure: {0}")]
    Transport(String),
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub accepted_ts: i64,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn place_order(
        &self,
        order_id: &str,
        instrument: &str,
        side: Side,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
}
