pub mod relay;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::ledger::models::{LockPaymentOrder, Network, PaymentOrder};

/// On-chain order actions for one chain family.
///
/// Each call returns the submitted transaction hash when the executor
/// reports one.
#[async_trait]
pub trait OrderLifecycle: Send + Sync {
    /// Open the gateway order for a fully paid receive address
    async fn create_order(&self, order: &PaymentOrder) -> AppResult<Option<String>>;

    /// Release escrow to the provider of a validated lock order
    async fn settle_order(&self, order: &LockPaymentOrder) -> AppResult<Option<String>>;

    /// Return escrow to the sender
    async fn refund_order(&self, network: &Network, gateway_id: &str) -> AppResult<Option<String>>;

    /// Send an unusable deposit back to the return address
    async fn revert_order(&self, order: &PaymentOrder) -> AppResult<Option<String>>;
}
