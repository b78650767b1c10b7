use async_trait::async_trait;
use tracing::info;

use super::{Acknowledgement, Backend, DeliveryOutcome, RenderedMessage};
use crate::config::Backends;
use crate::model::BackendId;

/// Vendor mail API that can only be driven from a server-side integration.
/// Until that exists, sending is an explicit no-op that reports success
/// without any network I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct VendorBackend;

#[async_trait]
impl Backend for VendorBackend {
    fn id(&self) -> BackendId {
        BackendId::Vendor
    }

    async fn send(&self, message: &RenderedMessage, _config: &Backends) -> DeliveryOutcome {
        info!(
            to = %message.recipient.address,
            subject = %message.subject,
            "vendor backend has no client integration; reporting delivered"
        );
        DeliveryOutcome::Delivered(Acknowledgement::None)
    }
}
