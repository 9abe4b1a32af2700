//! Playback-speed retiming math.
//!
//! ffmpeg's `atempo` audio filter only accepts a tempo multiplier in
//! [0.5, 2.0] per application, so an arbitrary speed factor has to be
//! decomposed into a chain of bounded stages whose product reconstructs
//! the requested factor. The video side needs no such decomposition: a
//! single `setpts` rescale by the reciprocal keeps both streams in sync.

use serde::{Deserialize, Serialize};

/// Lower bound of a single `atempo` application.
pub const ATEMPO_MIN: f64 = 0.5;
/// Upper bound of a single `atempo` application.
pub const ATEMPO_MAX: f64 = 2.0;

/// A validated playback-speed multiplier. Values above 1.0 speed the
/// video up, values below slow it down.
///
/// Construction rejects non-positive and non-finite values; range
/// policy beyond that (the host clamps to a configurable band, 0.1x to
/// 8x by default) belongs to the caller.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct SpeedFactor(f64);

impl SpeedFactor {
    pub fn new(value: f64) -> anyhow::Result<Self> {
        Self::try_from(value).map_err(anyhow::Error::msg)
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// The factor applied once to video presentation timestamps.
    pub fn pts_scale(self) -> f64 {
        1.0 / self.0
    }
}

impl TryFrom<f64> for SpeedFactor {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(format!(
                "speed factor must be a positive finite number, got {value}"
            ))
        }
    }
}

impl From<SpeedFactor> for f64 {
    fn from(speed: SpeedFactor) -> Self {
        speed.0
    }
}

impl std::fmt::Display for SpeedFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Greedily decompose `speed` into stage multipliers, each within
/// [`ATEMPO_MIN`, `ATEMPO_MAX`], whose product equals the input up to
/// floating-point rounding.
///
/// Factors already inside the band come back as a single-element chain.
/// Chain length grows logarithmically for extreme factors; the function
/// itself is total for any positive input and leaves range policy to
/// the caller.
pub fn tempo_chain(speed: SpeedFactor) -> Vec<f64> {
    let mut s = speed.get();
    let mut stages = Vec::new();

    while s > ATEMPO_MAX {
        stages.push(ATEMPO_MAX);
        s /= ATEMPO_MAX;
    }
    while s < ATEMPO_MIN {
        stages.push(ATEMPO_MIN);
        s *= ATEMPO_MAX;
    }
    stages.push(s);

    stages
}

/// Format the tempo chain as an `-af` filter argument, e.g.
/// `atempo=2,atempo=1.5` for a 3x speed-up.
pub fn atempo_filter(speed: SpeedFactor) -> String {
    tempo_chain(speed)
        .iter()
        .map(|stage| format!("atempo={stage}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Format the video-stream counterpart as a `-vf` filter argument.
pub fn setpts_filter(speed: SpeedFactor) -> String {
    format!("setpts={}*PTS", speed.pts_scale())
}

/// Short human-readable tag for output filenames: the factor at two
/// decimals with trailing zeros stripped (`1.50` -> `1.5`, `2.00` -> `2`).
pub fn speed_tag(speed: SpeedFactor) -> String {
    let tag = format!("{:.2}", speed.get());
    tag.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(value: f64) -> Vec<f64> {
        tempo_chain(SpeedFactor::new(value).unwrap())
    }

    #[test]
    fn factors_inside_band_pass_through() {
        assert_eq!(chain(1.0), vec![1.0]);
        assert_eq!(chain(2.0), vec![2.0]);
        assert_eq!(chain(0.5), vec![0.5]);
        assert_eq!(chain(1.37), vec![1.37]);
    }

    #[test]
    fn speed_up_factors_chain_doublings() {
        assert_eq!(chain(4.0), vec![2.0, 2.0]);
        assert_eq!(chain(8.0), vec![2.0, 2.0, 2.0]);
        assert_eq!(chain(3.0), vec![2.0, 1.5]);
    }

    #[test]
    fn slow_down_factors_chain_halvings() {
        assert_eq!(chain(0.25), vec![0.5, 0.5]);
        assert_eq!(chain(0.1), vec![0.5, 0.5, 0.5, 0.8]);
    }

    #[test]
    fn product_reconstructs_factor_and_stages_stay_bounded() {
        let mut s = 0.05;
        while s < 40.0 {
            let stages = chain(s);
            let product: f64 = stages.iter().product();
            assert!(
                (product - s).abs() < 1e-6,
                "product {product} != {s} for {stages:?}"
            );
            for stage in &stages {
                assert!(
                    (ATEMPO_MIN..=ATEMPO_MAX).contains(stage),
                    "stage {stage} out of band for speed {s}"
                );
            }
            s *= 1.0371;
        }
    }

    #[test]
    fn chain_length_grows_as_factor_leaves_band() {
        assert!(chain(2.0).len() < chain(4.1).len());
        assert!(chain(4.1).len() < chain(8.3).len());
        assert!(chain(0.5).len() < chain(0.24).len());
    }

    #[test]
    fn rejects_invalid_factors() {
        assert!(SpeedFactor::new(0.0).is_err());
        assert!(SpeedFactor::new(-1.5).is_err());
        assert!(SpeedFactor::new(f64::NAN).is_err());
        assert!(SpeedFactor::new(f64::INFINITY).is_err());
        assert!(SpeedFactor::new(0.1).is_ok());
    }

    #[test]
    fn filter_formatting() {
        let three_x = SpeedFactor::new(3.0).unwrap();
        assert_eq!(atempo_filter(three_x), "atempo=2,atempo=1.5");
        assert_eq!(
            atempo_filter(SpeedFactor::new(0.25).unwrap()),
            "atempo=0.5,atempo=0.5"
        );
        assert_eq!(atempo_filter(SpeedFactor::new(1.0).unwrap()), "atempo=1");

        assert_eq!(
            setpts_filter(SpeedFactor::new(2.0).unwrap()),
            "setpts=0.5*PTS"
        );
        assert_eq!(
            setpts_filter(SpeedFactor::new(0.5).unwrap()),
            "setpts=2*PTS"
        );
    }

    #[test]
    fn speed_tags_strip_trailing_zeros() {
        assert_eq!(speed_tag(SpeedFactor::new(2.0).unwrap()), "2");
        assert_eq!(speed_tag(SpeedFactor::new(1.5).unwrap()), "1.5");
        assert_eq!(speed_tag(SpeedFactor::new(0.25).unwrap()), "0.25");
        assert_eq!(speed_tag(SpeedFactor::new(1.333).unwrap()), "1.33");
    }

    #[test]
    fn query_style_deserialization() {
        let speed: SpeedFactor = serde_json::from_str("2.5").unwrap();
        assert_eq!(speed.get(), 2.5);
        assert!(serde_json::from_str::<SpeedFactor>("-1.0").is_err());
        assert!(serde_json::from_str::<SpeedFactor>("0").is_err());
    }
}
