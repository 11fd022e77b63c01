//! Adapter interfaces for external systems.
//!
//! Adapters give the hub a uniform way to reach things it does not own:
//! webhook endpoints and the deploy/context status sources behind the
//! resume snapshot.

pub mod status;
pub mod webhook;

pub use status::{
    ContextProvider, DeployStatus, DeployStatusProvider, FileContextProvider,
    FileDeployStatusProvider,
};
pub use webhook::{HttpWebhookSender, RecordingWebhookSender, WebhookResponse, WebhookSender};
