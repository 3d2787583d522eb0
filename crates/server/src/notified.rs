use partlog_primitives::Version;
use tokio::sync::watch;

/// A monotonically increasing version observers can wait on.
///
/// `when_at_least` observers are woken in non-decreasing version order;
/// `set` with a smaller value than the current one is a no-op, so the value
/// can never be observed going backwards.
#[derive(Debug)]
pub struct NotifiedVersion {
    tx: watch::Sender<u64>,
}

impl NotifiedVersion {
    pub fn new(initial: Version) -> Self {
        Self {
            tx: watch::channel(initial.0).0,
        }
    }

    pub fn get(&self) -> Version {
        Version(*self.tx.borrow())
    }

    /// Advance to `version` if it is larger than the current value.
    pub fn set(&self, version: Version) {
        self.tx.send_if_modified(|cur| {
            if version.0 > *cur {
                *cur = version.0;
                true
            } else {
                false
            }
        });
    }

    /// Resolve once the value is `>= version`.
    pub async fn when_at_least(&self, version: Version) {
        let mut rx = self.tx.subscribe();
        // Cannot fail: we hold the sender.
        let _ = rx.wait_for(|cur| *cur >= version.0).await;
    }

    /// Resolve once the value is `> version`.
    pub async fn when_greater(&self, version: Version) {
        self.when_at_least(Version(version.0 + 1)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiters_resolve_in_version_order() {
        let v = std::sync::Arc::new(NotifiedVersion::new(Version::ZERO));

        let v2 = v.clone();
        let waiter = tokio::spawn(async move { v2.when_at_least(Version(10)).await });

        v.set(Version(5));
        assert!(!waiter.is_finished());
        v.set(Version(10));
        waiter.await.unwrap();
        assert_eq!(v.get(), Version(10));
    }

    #[tokio::test]
    async fn set_never_regresses() {
        let v = NotifiedVersion::new(Version(20));
        v.set(Version(10));
        assert_eq!(v.get(), Version(20));
    }
}
