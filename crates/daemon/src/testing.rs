//! Fixtures shared by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use common::bus::{BusError, Message, Reply, Responder, ServiceRequest};

/// Zip bundle built from `(relative path, source)` pairs.
pub fn bundle(files: &[(&str, &str)]) -> Bytes {
    let src = tempfile::tempdir().unwrap();
    for (name, body) in files {
        let path = src.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
    let out = tempfile::tempdir().unwrap();
    let dst = common::bundle::build(src.path(), &out.path().join("bundle.fzz")).unwrap();
    Bytes::from(std::fs::read(dst).unwrap())
}

struct Discard;

#[async_trait]
impl Responder for Discard {
    async fn respond(self: Box<Self>, _reply: Reply) -> Result<(), BusError> {
        Ok(())
    }
}

/// A request whose reply goes nowhere, for driving stages directly.
pub fn detached_request(endpoint: &str) -> ServiceRequest {
    ServiceRequest::new(
        endpoint,
        Message::new("test", Bytes::new()),
        Box::new(Discard),
    )
}
