//! Destination uploaders
//!
//! Both variants push a staged file to its destination and report throttled
//! upload progress; the rate is measured from the start of the upload only.

mod body;
pub mod chat;
pub mod cloud;
pub mod mime;

pub use chat::{ChatTransport, ChatUploader, DocumentUpload, MessageReceipt};
pub use cloud::{CloudReceipt, DriveUploader};
pub(crate) use body::counting_body;
