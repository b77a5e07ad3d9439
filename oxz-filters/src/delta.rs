//! Delta filter.
//!
//! Replaces each byte with its difference to the byte `distance` positions
//! earlier in the uncompressed data. Useful as a preprocessor for sampled
//! data (audio, raster images) where neighbouring samples correlate.

use oxz_core::error::{Result, XzError};

use crate::simple::InPlaceFilter;

/// Smallest allowed delta distance.
pub const DELTA_DIST_MIN: usize = 1;

/// Largest allowed delta distance.
pub const DELTA_DIST_MAX: usize = 256;

/// Streaming delta transform.
///
/// The history ring always holds the last 256 bytes of *uncompressed* data,
/// which on the encoding side is the input and on the decoding side the
/// output; positions before the start of the stream read as zero.
#[derive(Debug, Clone)]
pub struct DeltaFilter {
    distance: usize,
    encode: bool,
    history: [u8; DELTA_DIST_MAX],
    pos: u64,
}

impl DeltaFilter {
    /// Create a delta filter with the given distance and direction.
    pub fn new(distance: usize, encode: bool) -> Result<Self> {
        if !(DELTA_DIST_MIN..=DELTA_DIST_MAX).contains(&distance) {
            return Err(XzError::options(format!(
                "delta distance {distance} out of range {DELTA_DIST_MIN}..{DELTA_DIST_MAX}"
            )));
        }
        Ok(Self {
            distance,
            encode,
            history: [0; DELTA_DIST_MAX],
            pos: 0,
        })
    }

    /// The configured distance.
    pub fn distance(&self) -> usize {
        self.distance
    }

    /// Serialize the filter properties (a single byte holding distance - 1).
    pub fn props(&self) -> Vec<u8> {
        vec![(self.distance - 1) as u8]
    }

    /// Build a filter from serialized properties.
    pub fn from_props(props: &[u8], encode: bool) -> Result<Self> {
        let [dist] = props else {
            return Err(XzError::options("delta properties must be one byte"));
        };
        Self::new(usize::from(*dist) + 1, encode)
    }

    fn earlier(&self, abs: u64) -> u8 {
        let d = self.distance as u64;
        if abs < d {
            0
        } else {
            self.history[((abs - d) % DELTA_DIST_MAX as u64) as usize]
        }
    }
}

impl InPlaceFilter for DeltaFilter {
    fn filter(&mut self, buf: &mut [u8]) -> usize {
        let mut abs = self.pos;
        for byte in buf.iter_mut() {
            let prev = self.earlier(abs);
            let plain = if self.encode {
                let plain = *byte;
                *byte = byte.wrapping_sub(prev);
                plain
            } else {
                *byte = byte.wrapping_add(prev);
                *byte
            };
            self.history[(abs % DELTA_DIST_MAX as u64) as usize] = plain;
            abs += 1;
        }
        self.pos = abs;
        buf.len()
    }

    fn look_ahead(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(distance: usize, data: &[u8]) {
        let mut enc = DeltaFilter::new(distance, true).unwrap();
        let mut dec = DeltaFilter::new(distance, false).unwrap();

        let mut buf = data.to_vec();
        assert_eq!(enc.filter(&mut buf), data.len());
        assert_eq!(dec.filter(&mut buf), data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn test_distance_one_ramp() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut enc = DeltaFilter::new(1, true).unwrap();
        let mut buf = data.clone();
        enc.filter(&mut buf);

        // A ramp deltas to a run of ones (first byte kept as-is).
        assert_eq!(buf[0], 0);
        assert!(buf[1..].iter().all(|&b| b == 1));

        let mut dec = DeltaFilter::new(1, false).unwrap();
        dec.filter(&mut buf);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_roundtrip_all_distances() {
        let data: Vec<u8> = (0..2000).map(|i| (i * 17 + i / 3) as u8).collect();
        for distance in [1, 2, 3, 4, 16, 255, 256] {
            roundtrip(distance, &data);
        }
    }

    #[test]
    fn test_roundtrip_chunked_matches_oneshot() {
        let data: Vec<u8> = (0..999).map(|i| (i * 31) as u8).collect();

        let mut oneshot = data.clone();
        DeltaFilter::new(7, true).unwrap().filter(&mut oneshot);

        let mut chunked = data.clone();
        let mut enc = DeltaFilter::new(7, true).unwrap();
        for chunk in chunked.chunks_mut(13) {
            enc.filter(chunk);
        }

        assert_eq!(chunked, oneshot);
    }

    #[test]
    fn test_props_roundtrip() {
        for distance in [1, 100, 256] {
            let filter = DeltaFilter::new(distance, true).unwrap();
            let restored = DeltaFilter::from_props(&filter.props(), false).unwrap();
            assert_eq!(restored.distance(), distance);
        }
    }

    #[test]
    fn test_bad_options() {
        assert!(DeltaFilter::new(0, true).is_err());
        assert!(DeltaFilter::new(257, true).is_err());
        assert!(DeltaFilter::from_props(&[], true).is_err());
        assert!(DeltaFilter::from_props(&[1, 2], true).is_err());
    }
}
