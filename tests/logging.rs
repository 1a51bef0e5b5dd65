mod common;

use common::manual_store;
use dripline::{DistributedRateLimiter, LogSink};
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
    let out = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(out.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (out, guard)
}

#[tokio::test]
async fn lifecycle_is_logged_with_prefix() {
    let (out, _guard) = capture();
    let (_clock, store) = manual_store();
    let limiter = DistributedRateLimiter::builder(store, "logged")
        .tokens_per_second(10.0)
        .sink(LogSink)
        .connect()
        .await
        .unwrap();
    assert!(limiter.try_remove_tokens(1.0).await.unwrap());

    let text = out.text();
    assert!(text.contains("created bucket configuration"), "{text}");
    assert!(text.contains("rate limiter ready"), "{text}");
    assert!(text.contains("prefix=logged"), "{text}");
    assert!(text.contains("bucket_event"), "{text}");
    assert!(text.contains("Admission::Granted(count=1)"), "{text}");
}

#[tokio::test]
async fn initialization_failure_is_logged_as_error() {
    let (out, _guard) = capture();
    let (_clock, store) = manual_store();
    store.put("failing.conf", r#"{"tokensPerSecond":1}"#);

    let result = DistributedRateLimiter::builder(store, "failing")
        .tokens_per_second(2.0)
        .connect()
        .await;
    assert!(result.unwrap_err().is_config_mismatch());

    let text = out.text();
    assert!(text.contains("ERROR"), "{text}");
    assert!(text.contains("rate limiter initialization failed"), "{text}");
}

#[tokio::test]
async fn over_settlement_warns() {
    let (out, _guard) = capture();
    let (_clock, store) = manual_store();
    let limiter = DistributedRateLimiter::builder(store, "drift")
        .tokens_per_second(10.0)
        .connect()
        .await
        .unwrap();
    limiter.clear_transaction(0.0, Some(2.0)).await.unwrap();

    let text = out.text();
    assert!(text.contains("WARN"), "{text}");
    assert!(text.contains("settled more than was reserved"), "{text}");
}
