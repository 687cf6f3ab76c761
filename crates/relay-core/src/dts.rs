//! Incremental PTS → DTS extraction.
//!
//! Muxer-facing readers need a decode timestamp for codecs that can
//! reorder frames. The extractor here is conservative rather than
//! bitstream-aware: DTS starts at the first PTS, never exceeds the
//! current PTS, and is forced monotonic. For streams without frame
//! reordering this yields DTS == PTS; with reordering it holds the last
//! value instead of going backwards.

/// Per-track DTS extractor.
#[derive(Debug, Default)]
pub struct DtsExtractor {
    prev_dts: Option<i64>,
}

impl DtsExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the DTS for a frame with the given PTS (nanoseconds).
    pub fn extract(&mut self, pts: i64) -> i64 {
        let dts = match self.prev_dts {
            None => pts,
            Some(prev) => {
                if pts >= prev {
                    pts
                } else {
                    prev
                }
            }
        };
        self.prev_dts = Some(dts);
        dts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_input_passes_through() {
        let mut e = DtsExtractor::new();
        assert_eq!(e.extract(0), 0);
        assert_eq!(e.extract(33_000_000), 33_000_000);
        assert_eq!(e.extract(66_000_000), 66_000_000);
    }

    #[test]
    fn reordered_input_never_goes_backwards() {
        let mut e = DtsExtractor::new();
        assert_eq!(e.extract(100), 100);
        assert_eq!(e.extract(50), 100);
        assert_eq!(e.extract(150), 150);
    }
}
