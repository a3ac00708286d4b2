//! Update Arbitration
//!
//! Polls every configured source and picks the single best candidate newer
//! than the installed version.

use futures_util::future::join_all;
use std::time::Duration;
use tracing::info;

use super::probe::{SourceProbe, UpdateAdvertisement};
use super::version::VersionId;

pub struct UpdateArbiter;

impl UpdateArbiter {
    /// Probe all sources concurrently and select the best advertisement
    ///
    /// Results are combined in configured order, not completion order, so a
    /// tie always goes to the source configured first.
    pub async fn select_best<P: SourceProbe>(
        sources: &[P],
        current: VersionId,
        timeout: Duration,
    ) -> Option<UpdateAdvertisement> {
        let advertisements = join_all(sources.iter().map(|source| source.probe(timeout))).await;

        for advertisement in advertisements.iter().flatten() {
            info!(
                source = %advertisement.source,
                version = %advertisement.version,
                filename = %advertisement.filename,
                "source advertises firmware"
            );
        }

        let best = Self::pick_best(advertisements.into_iter().flatten(), current);
        match &best {
            Some(candidate) => info!(
                source = %candidate.source,
                version = %candidate.version,
                installed = %current,
                "update candidate selected"
            ),
            None => info!(installed = %current, "no newer firmware advertised"),
        }
        best
    }

    /// Keep the strictly greatest version above `current`; earlier entries win ties.
    pub fn pick_best<I>(advertisements: I, current: VersionId) -> Option<UpdateAdvertisement>
    where
        I: IntoIterator<Item = UpdateAdvertisement>,
    {
        let mut best: Option<UpdateAdvertisement> = None;
        let mut floor = current;

        for advertisement in advertisements {
            if advertisement.version.is_newer_than(&floor) {
                floor = advertisement.version;
                best = Some(advertisement);
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::probe::SourceDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    struct FakeProbe {
        descriptor: SourceDescriptor,
        version: Option<&'static str>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProbe {
        fn new(name: &str, version: Option<&'static str>) -> Self {
            Self {
                descriptor: SourceDescriptor::new(name, format!("http://{}.invalid", name)),
                version,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl SourceProbe for FakeProbe {
        fn descriptor(&self) -> &SourceDescriptor {
            &self.descriptor
        }

        async fn probe(&self, timeout: Duration) -> Option<UpdateAdvertisement> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return None;
            }
            tokio::time::sleep(self.delay).await;
            self.version.map(|v| UpdateAdvertisement {
                version: VersionId::parse(v),
                filename: format!("{}_firmware_v{}.bin", self.descriptor.name, v),
                digest: "digest".to_string(),
                source: self.descriptor.name.clone(),
            })
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn test_strictly_greater_wins_regardless_of_source() {
        let sources = [
            FakeProbe::new("oem", Some("1.2")),
            FakeProbe::new("malicious", Some("1.3")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.1"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(best.source, "malicious");
        assert_eq!(best.version, VersionId::new(1, 3));
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_configured() {
        let sources = [
            FakeProbe::new("oem", Some("1.2")),
            FakeProbe::new("malicious", Some("1.2")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.1"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(best.source, "oem");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_ignores_completion_order() {
        let sources = [
            FakeProbe::new("oem", Some("1.2")).delayed(Duration::from_secs(2)),
            FakeProbe::new("malicious", Some("1.2")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.0"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(best.source, "oem");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_probed_concurrently() {
        let sources = [
            FakeProbe::new("oem", Some("1.1")).delayed(Duration::from_secs(2)),
            FakeProbe::new("malicious", Some("1.0")).delayed(Duration::from_secs(2)),
        ];

        let started = Instant::now();
        UpdateArbiter::select_best(&sources, VersionId::parse("1.0"), TIMEOUT).await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_only_newer_candidate_is_returned() {
        let sources = [
            FakeProbe::new("oem", Some("1.0")),
            FakeProbe::new("malicious", Some("1.1")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.0"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(best.source, "malicious");
    }

    #[tokio::test]
    async fn test_nothing_newer_yields_none() {
        let sources = [
            FakeProbe::new("oem", Some("1.0")),
            FakeProbe::new("malicious", Some("0.9")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.0"), TIMEOUT).await;
        assert!(best.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_source_does_not_block_others() {
        let sources = [
            FakeProbe::new("oem", None),
            FakeProbe::new("slow", Some("9.9")).delayed(Duration::from_secs(60)),
            FakeProbe::new("malicious", Some("1.4")),
        ];

        let best = UpdateArbiter::select_best(&sources, VersionId::parse("1.0"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(best.source, "malicious");
        assert!(sources.iter().all(|s| s.calls.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_pick_best_keeps_earliest_maximum() {
        let ad = |source: &str, version: &str| UpdateAdvertisement {
            version: VersionId::parse(version),
            filename: format!("{}.bin", source),
            digest: String::new(),
            source: source.to_string(),
        };

        let best = UpdateArbiter::pick_best(
            vec![ad("a", "1.2"), ad("b", "1.5"), ad("c", "1.5"), ad("d", "1.4")],
            VersionId::parse("1.0"),
        )
        .unwrap();
        assert_eq!(best.source, "b");
    }
}
