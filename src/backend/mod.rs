// restvirt control plane access
//
// Volumes live at /volumes, attachments at /domains/{node}/volumes/{volume}.

pub mod client;
pub mod error;
pub mod models;
pub mod traits;

pub use client::RestClient;
pub use error::{BackendError, BackendResult};
pub use models::{Attachment, CreateVolumeInput, Volume};
#[cfg(any(test, feature = "mockall"))]
pub use traits::MockVolumeBackend;
pub use traits::VolumeBackend;
