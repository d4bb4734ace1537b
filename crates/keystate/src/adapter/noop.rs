use super::{AdapterFuture, StorageAdapter};

/// Adapter for environments without usable storage: reads find nothing and
/// writes succeed without keeping anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdapter;

impl StorageAdapter for NoopAdapter {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn get_item<'a>(&'a self, _key: &'a str) -> AdapterFuture<'a, Option<String>> {
        Box::pin(async { Ok(None) })
    }

    fn set_item<'a>(&'a self, _key: &'a str, _value: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn remove_item<'a>(&'a self, _key: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_vanish() {
        let adapter = NoopAdapter;
        adapter.set_item("k", "v").await.unwrap();
        assert_eq!(adapter.get_item("k").await.unwrap(), None);
        adapter.remove_item("k").await.unwrap();
    }
}
