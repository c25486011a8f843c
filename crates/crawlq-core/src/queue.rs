use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// One message handed out by a [`MessageQueue`] consumer.
///
/// Exactly one of [`success`](Delivery::success), [`try_again`](Delivery::try_again)
/// or [`reject`](Delivery::reject) must be called per delivery. Each takes
/// `self`, so a second acknowledgement does not compile. A delivery dropped
/// without acknowledgement is redelivered by the transport.
pub trait Delivery: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    /// Durable ack; the message will not be delivered again.
    fn success(self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Negative ack, requeue for redelivery.
    fn try_again(self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Negative ack without requeue; the message is dropped or dead-lettered.
    fn reject(self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Durable, at-least-once message transport.
///
/// Implementations must tolerate concurrent `publish` calls from many workers.
pub trait MessageQueue: Send + Sync + Clone + 'static {
    type Delivery: Delivery;

    /// Make sure the queue exists. Idempotent.
    fn declare_queue(&self, queue: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn publish(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Start consuming. Deliveries arrive on the returned channel until
    /// `cancel` fires or the receiver is dropped.
    fn consume(
        &self,
        queue: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<Self::Delivery>, AppError>> + Send;
}

/// Terminal acknowledgement chosen for a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Success,
    TryAgain,
    Reject,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Success => "success",
            Ack::TryAgain => "try_again",
            Ack::Reject => "reject",
        }
    }

    /// Apply this acknowledgement, consuming the delivery.
    pub async fn apply<D: Delivery>(self, delivery: D) -> Result<(), AppError> {
        match self {
            Ack::Success => delivery.success().await,
            Ack::TryAgain => delivery.try_again().await,
            Ack::Reject => delivery.reject().await,
        }
    }
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDelivery;

    #[tokio::test]
    async fn test_apply_invokes_matching_action() {
        for ack in [Ack::Success, Ack::TryAgain, Ack::Reject] {
            let (delivery, log) = MockDelivery::new(b"{}".to_vec());
            ack.apply(delivery).await.unwrap();
            assert_eq!(*log.lock().unwrap(), vec![ack]);
        }
    }
}
