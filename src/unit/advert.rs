use super::{ExecutionUnit, Scope, UnitKind, UnitMetadata, UnitOutcome, UnitProjection};
use crate::error::Result;
use crate::events::AdAired;
use crate::stage::Stage;
use crate::wait::Cancelled;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "wav", "flac"];

/// Sponsor tier, chosen by audience size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdTier {
    LocalBusiness,
    RegionalBrand,
    NationalSponsor,
    PremiumSponsor,
}

impl AdTier {
    pub const ALL: [AdTier; 4] = [
        AdTier::LocalBusiness,
        AdTier::RegionalBrand,
        AdTier::NationalSponsor,
        AdTier::PremiumSponsor,
    ];

    pub fn for_listeners(listeners: u32) -> AdTier {
        match listeners {
            0..200 => AdTier::LocalBusiness,
            200..500 => AdTier::RegionalBrand,
            500..1000 => AdTier::NationalSponsor,
            _ => AdTier::PremiumSponsor,
        }
    }

    /// Money per listener per slot.
    pub fn rate(self) -> f64 {
        match self {
            AdTier::LocalBusiness => 0.02,
            AdTier::RegionalBrand => 0.05,
            AdTier::NationalSponsor => 0.08,
            AdTier::PremiumSponsor => 0.12,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AdTier::LocalBusiness => "Local Business",
            AdTier::RegionalBrand => "Regional Brand",
            AdTier::NationalSponsor => "National Sponsor",
            AdTier::PremiumSponsor => "Premium Sponsor",
        }
    }

    /// File name prefix for this tier's spots.
    pub fn slug(self) -> &'static str {
        match self {
            AdTier::LocalBusiness => "localbusiness",
            AdTier::RegionalBrand => "regionalbrand",
            AdTier::NationalSponsor => "nationalsponsor",
            AdTier::PremiumSponsor => "premiumsponsor",
        }
    }
}

/// `slots × listeners × rate(tier(listeners))`
pub fn ad_revenue(slots: usize, listeners: u32) -> f64 {
    slots as f64 * listeners as f64 * AdTier::for_listeners(listeners).rate()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advert {
    pub slots: usize,
    pub duration: Duration,
    /// Fixed spot. When absent a variant for the current tier is drawn from the catalog.
    pub audio: Option<PathBuf>,
    pub sponsor: Option<String>,
}

impl Advert {
    pub fn new(duration: Duration) -> Self {
        Advert {
            slots: 1,
            duration,
            audio: None,
            sponsor: None,
        }
    }

    pub fn with_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.audio = Some(path.into());
        self
    }

    pub fn with_sponsor(mut self, sponsor: impl Into<String>) -> Self {
        self.sponsor = Some(sponsor.into());
        self
    }
}

/// Ad spots and break jingles found on disk.
#[derive(Debug, Default)]
pub struct AdCatalog {
    spots: HashMap<AdTier, Vec<PathBuf>>,
    break_jingle: Option<PathBuf>,
    return_jingle: Option<PathBuf>,
}

impl AdCatalog {
    /// Index a directory. Spots are named `<tier slug>_<n>.<ext>`; jingles are
    /// `break_jingle.<ext>` and `return_jingle.<ext>`.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut catalog = AdCatalog::default();
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            })
            .collect();
        entries.sort();

        for path in entries {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_lowercase) else {
                continue;
            };
            if stem == "break_jingle" {
                catalog.break_jingle = Some(path);
            } else if stem == "return_jingle" {
                catalog.return_jingle = Some(path);
            } else if let Some(tier) = AdTier::ALL.into_iter().find(|t| stem.starts_with(t.slug())) {
                catalog.insert(tier, path);
            }
        }
        tracing::info!(
            "ad catalog: {} spots from {}",
            catalog.len(),
            dir.display()
        );
        Ok(catalog)
    }

    pub fn insert(&mut self, tier: AdTier, path: PathBuf) {
        self.spots.entry(tier).or_default().push(path);
    }

    /// A random variant for `tier`, if any exist.
    pub fn pick(&self, tier: AdTier) -> Option<PathBuf> {
        let spots = self.spots.get(&tier)?;
        if spots.is_empty() {
            return None;
        }
        Some(spots[fastrand::usize(..spots.len())].clone())
    }

    pub fn break_jingle(&self) -> Option<PathBuf> {
        self.break_jingle.clone()
    }

    pub fn return_jingle(&self) -> Option<PathBuf> {
        self.return_jingle.clone()
    }

    pub fn len(&self) -> usize {
        self.spots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Air one advert under its own scope. Revenue is worked out from the
/// audience at the moment the spot finishes.
pub(super) async fn run_advert(
    unit_id: &str,
    advert: &Advert,
    mut metadata: UnitMetadata,
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let tier = AdTier::for_listeners(stage.listeners.current_listeners());
    let audio = advert.audio.clone().or_else(|| stage.ads.pick(tier));
    let sponsor = advert
        .sponsor
        .clone()
        .unwrap_or_else(|| tier.display_name().to_string());
    metadata.tier = Some(tier);

    let projection = UnitProjection {
        id: unit_id.to_string(),
        kind: UnitKind::Ad,
        text: Some(format!("This commercial break sponsored by {}", sponsor)),
        audio: audio.clone(),
        duration: advert.duration,
        metadata,
    };

    let cue = stage.cue(audio.as_deref());
    let scope = Scope::open(stage, projection, cancel);
    scope.start(cue.measured());

    let result = match stage.play(&cue, advert.duration, scope.token()).await {
        Ok(()) => {
            let listeners = stage.listeners.current_listeners();
            let revenue = ad_revenue(advert.slots, listeners);
            stage.revenue.add_money(revenue, "Ad Revenue");
            stage.events.publish(AdAired {
                unit_id: unit_id.to_string(),
                tier: AdTier::for_listeners(listeners),
                listeners,
                revenue,
            });
            Ok(UnitOutcome::Completed)
        }
        Err(Cancelled) => Err(Cancelled),
    };
    scope.finish(result)
}

/// Air each advert in turn. Every spot gets its own lifecycle events, indexed
/// `1..=N` of `N` in its metadata.
pub(super) async fn run_sequence(
    unit: &ExecutionUnit,
    adverts: &[Advert],
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(None);

    let total = adverts.len();
    let mut result = Ok(UnitOutcome::Completed);
    for (i, advert) in adverts.iter().enumerate() {
        if scope.token().is_cancelled() {
            result = Err(Cancelled);
            break;
        }
        let metadata = UnitMetadata {
            ad_index: Some(i + 1),
            ad_total: Some(total),
            ..unit.metadata().clone()
        };
        let ad_id = format!("{}_ad{}", unit.id(), i + 1);
        if let Err(e) = run_advert(&ad_id, advert, metadata, stage, scope.token()).await {
            tracing::debug!(unit = unit.id(), ad = i + 1, "sequence stopped: {}", e);
            result = Err(Cancelled);
            break;
        }
    }
    scope.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{UnitInterrupted, UnitStarted};
    use crate::stage::testing::rig;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tiers_follow_listener_thresholds() {
        assert_eq!(AdTier::for_listeners(0), AdTier::LocalBusiness);
        assert_eq!(AdTier::for_listeners(199), AdTier::LocalBusiness);
        assert_eq!(AdTier::for_listeners(200), AdTier::RegionalBrand);
        assert_eq!(AdTier::for_listeners(499), AdTier::RegionalBrand);
        assert_eq!(AdTier::for_listeners(500), AdTier::NationalSponsor);
        assert_eq!(AdTier::for_listeners(999), AdTier::NationalSponsor);
        assert_eq!(AdTier::for_listeners(1000), AdTier::PremiumSponsor);
    }

    #[test]
    fn revenue_formula() {
        assert!((ad_revenue(1, 250) - 12.5).abs() < 1e-9);
        assert!((ad_revenue(3, 1200) - 3.0 * 1200.0 * 0.12).abs() < 1e-9);
        assert_eq!(ad_revenue(2, 0), 0.0);
    }

    #[test]
    fn catalog_scans_tier_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "localbusiness_1.mp3",
            "localbusiness_2.mp3",
            "premiumsponsor_1.ogg",
            "break_jingle.wav",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let catalog = AdCatalog::scan(dir.path()).unwrap();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.pick(AdTier::RegionalBrand).is_none());
        let local = catalog.pick(AdTier::LocalBusiness).unwrap();
        assert!(local.file_name().unwrap().to_str().unwrap().starts_with("localbusiness_"));
        assert!(catalog.break_jingle().is_some());
        assert!(catalog.return_jingle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn advert_awards_revenue_at_completion() {
        let r = rig(250, 2);
        let aired = Arc::new(Mutex::new(Vec::new()));
        let a = aired.clone();
        r.stage
            .events
            .subscribe(move |e: &AdAired| a.lock().unwrap().push(e.clone()));

        let unit = ExecutionUnit::advert("spot", Advert::new(Duration::from_secs(18)));
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert!((r.ledger.total() - 250.0 * 0.05).abs() < 1e-9);
        let aired = aired.lock().unwrap();
        assert_eq!(aired.len(), 1);
        assert_eq!(aired[0].tier, AdTier::RegionalBrand);
    }

    #[tokio::test(start_paused = true)]
    async fn revenue_uses_audience_at_completion() {
        let r = rig(150, 2);
        let gauge = r.listeners.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            crate::station::ListenerProvider::modify_listeners(gauge.as_ref(), 100);
        });

        let unit = ExecutionUnit::advert("spot", Advert::new(Duration::from_secs(18)));
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();
        assert!((r.ledger.total() - 250.0 * 0.05).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_advert_pays_nothing() {
        let r = rig(500, 2);
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            t.cancel();
        });
        let unit = ExecutionUnit::advert("spot", Advert::new(Duration::from_secs(18)));
        assert!(unit.execute(&r.stage, &token).await.is_err());
        assert_eq!(r.ledger.total(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_indexes_each_ad() {
        let r = rig(100, 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        r.stage.events.subscribe(move |e: &UnitStarted| {
            if e.projection.kind == UnitKind::Ad {
                let m = &e.projection.metadata;
                s.lock().unwrap().push((m.ad_index, m.ad_total));
            }
        });

        let ads = vec![Advert::new(Duration::from_secs(18)); 3];
        let unit = ExecutionUnit::ad_sequence("break_1", ads);
        let start = tokio::time::Instant::now();
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(54));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some(1), Some(3)), (Some(2), Some(3)), (Some(3), Some(3))]
        );
        assert_eq!(r.ledger.entries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sequence_stops_after_current_ad() {
        let r = rig(100, 2);
        let interrupted = Arc::new(Mutex::new(Vec::new()));
        let i = interrupted.clone();
        r.stage
            .events
            .subscribe(move |e: &UnitInterrupted| i.lock().unwrap().push(e.unit_id.clone()));

        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            t.cancel();
        });
        let unit = ExecutionUnit::ad_sequence("break_1", vec![Advert::new(Duration::from_secs(18)); 3]);
        assert!(unit.execute(&r.stage, &token).await.is_err());

        assert_eq!(r.ledger.entries().len(), 1);
        assert_eq!(*interrupted.lock().unwrap(), vec!["break_1_ad2", "break_1"]);
    }
}
