pub mod abi;
pub mod evm;
pub mod registry;
pub mod rest;

use async_trait::async_trait;

use crate::error::AppResult;

pub use registry::{ChainRegistry, NetworkHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub block_number: u64,
    pub tx_hash: String,
    pub token: String,
    pub from: String,
    pub to: String,
    /// Token subunits
    pub value: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCreatedEvent {
    pub block_number: u64,
    pub tx_hash: String,
    pub sender: String,
    pub token: String,
    pub amount: u128,
    pub protocol_fee: u128,
    /// Gateway id, `0x`-prefixed bytes32
    pub order_id: String,
    pub rate: u128,
    pub institution_code: String,
    /// Base64 ciphertext of the recipient details
    pub message_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSettledEvent {
    pub block_number: u64,
    pub tx_hash: String,
    pub split_order_id: String,
    pub order_id: String,
    pub liquidity_provider: String,
    pub settle_percent: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRefundedEvent {
    pub block_number: u64,
    pub tx_hash: String,
    pub fee: u128,
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Transfer(TransferEvent),
    OrderCreated(OrderCreatedEvent),
    OrderSettled(OrderSettledEvent),
    OrderRefunded(OrderRefundedEvent),
}

impl ChainEvent {
    pub fn block_number(&self) -> u64 {
        match self {
            ChainEvent::Transfer(e) => e.block_number,
            ChainEvent::OrderCreated(e) => e.block_number,
            ChainEvent::OrderSettled(e) => e.block_number,
            ChainEvent::OrderRefunded(e) => e.block_number,
        }
    }

    pub fn tx_hash(&self) -> &str {
        match self {
            ChainEvent::Transfer(e) => &e.tx_hash,
            ChainEvent::OrderCreated(e) => &e.tx_hash,
            ChainEvent::OrderSettled(e) => &e.tx_hash,
            ChainEvent::OrderRefunded(e) => &e.tx_hash,
        }
    }

    /// Whether the event satisfies `filter`, used by transports that
    /// cannot filter server-side
    pub fn matches(&self, filter: &LogFilter) -> bool {
        let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
        match (self, filter) {
            (ChainEvent::Transfer(e), LogFilter::Transfers { token, to }) => {
                same(&e.token, token) && same(&e.to, to)
            }
            (ChainEvent::OrderCreated(e), LogFilter::OrderCreated { sender }) => {
                sender.as_deref().map_or(true, |s| same(&e.sender, s))
            }
            (ChainEvent::OrderSettled(e), LogFilter::OrderSettled { order_id }) => {
                order_id.as_deref().map_or(true, |id| same(&e.order_id, id))
            }
            (ChainEvent::OrderRefunded(e), LogFilter::OrderRefunded { order_id }) => {
                order_id.as_deref().map_or(true, |id| same(&e.order_id, id))
            }
            _ => false,
        }
    }
}

/// Which events to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFilter {
    /// Token transfers into one address
    Transfers { token: String, to: String },
    OrderCreated { sender: Option<String> },
    OrderSettled { order_id: Option<String> },
    OrderRefunded { order_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct LogQuery {
    pub filter: LogFilter,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    /// Window of `lookback` blocks ending at `head`
    pub fn recent(filter: LogFilter, head: u64, lookback: u64) -> Self {
        Self {
            filter,
            from_block: head.saturating_sub(lookback),
            to_block: head,
        }
    }
}

/// Read access to one network. Both transports return the same decoded
/// events so call sites never branch on the network family.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block_height(&self) -> AppResult<u64>;

    /// Events matching `query`, in ascending block order
    async fn filter_logs(&self, query: &LogQuery) -> AppResult<Vec<ChainEvent>>;

    /// Every known event emitted by one transaction
    async fn transaction_events(&self, tx_hash: &str) -> AppResult<Vec<ChainEvent>>;
}

/// Sort by block and drop events outside `[from, to]`
pub(crate) fn in_block_order(mut events: Vec<ChainEvent>, query: &LogQuery) -> Vec<ChainEvent> {
    events.retain(|e| (query.from_block..=query.to_block).contains(&e.block_number()));
    events.sort_by_key(|e| e.block_number());
    events
}
