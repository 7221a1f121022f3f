//! Frequency-channel selection.
//!
//! Independent criteria (receive channels, frequency band, calibration SNR,
//! top-K SNR, foreground/background variance) each produce a candidate
//! set; the selection is their intersection, further intersected across
//! calibration sources and with the channels present in the measurement.

use std::ops::Range;

use ndarray::{Array3, Axis};
use num_complex::Complex64;

use crate::error::RecoError;
use crate::params::RecoParams;
use crate::source::{CalibrationSource, MeasurementSource};
use crate::types::{ChannelIndex, FrequencySelection};

/// Foreground/background discrimination settings.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceFilter {
    pub threshold: f64,
    pub fg_frames: Range<usize>,
    pub bg_frames: Range<usize>,
}

/// Frequency-selection criteria.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyFilter {
    pub min_freq: f64,
    pub max_freq: Option<f64>,
    pub snr_thresh: Option<f64>,
    pub num_used_freqs: Option<usize>,
    pub rec_channels: Vec<usize>,
    pub variance: Option<VarianceFilter>,
}

impl FrequencyFilter {
    pub fn from_params(params: &RecoParams) -> Self {
        let variance = match (params.var_mean_thresh, &params.fg_frames, &params.bg_frames) {
            (Some(threshold), Some(fg), Some(bg)) => Some(VarianceFilter {
                threshold,
                fg_frames: fg.clone(),
                bg_frames: bg.clone(),
            }),
            _ => None,
        };
        Self {
            min_freq: params.min_freq,
            max_freq: params.max_freq,
            snr_thresh: params.snr_thresh,
            num_used_freqs: params.num_used_freqs,
            rec_channels: params.rec_channels.clone(),
            variance,
        }
    }
}

/// Channels of one calibration that pass the receive-channel, band, SNR
/// and top-K criteria.
pub fn calibration_channels(source: &dyn CalibrationSource, filter: &FrequencyFilter) -> FrequencySelection {
    let freqs = source.frequencies();
    let snr = source.snr();

    let mut candidates: Vec<ChannelIndex> = source
        .all_channels()
        .into_iter()
        .filter(|c| filter.rec_channels.contains(&c.receiver))
        .filter(|c| {
            let f = freqs[c.bin];
            f >= filter.min_freq && filter.max_freq.map_or(true, |max| f <= max)
        })
        .filter(|c| filter.snr_thresh.map_or(true, |t| snr[[c.bin, c.receiver]] >= t))
        .collect();

    if let Some(k) = filter.num_used_freqs {
        // Stable sort keeps linear order among equal SNRs.
        candidates.sort_by(|a, b| {
            snr[[b.bin, b.receiver]]
                .partial_cmp(&snr[[a.bin, a.receiver]])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
    }
    FrequencySelection::new(candidates)
}

/// Score per channel: |mean_fg − mean_bg| / std_bg, over all periods.
fn variance_scores(
    measurement: &dyn MeasurementSource,
    channels: &[ChannelIndex],
    filter: &VarianceFilter,
) -> Result<Vec<f64>, RecoError> {
    let fg = measurement.measurement(channels, filter.fg_frames.clone())?;
    let bg = measurement.measurement(channels, filter.bg_frames.clone())?;
    let mean = |block: &Array3<Complex64>, c: usize| {
        let lane = block.index_axis(Axis(0), c);
        lane.sum() / Complex64::from(lane.len().max(1) as f64)
    };
    Ok((0..channels.len())
        .map(|c| {
            let mu_fg = mean(&fg, c);
            let mu_bg = mean(&bg, c);
            let lane = bg.index_axis(Axis(0), c);
            let var = lane.iter().map(|u| (u - mu_bg).norm_sqr()).sum::<f64>() / lane.len().max(1) as f64;
            let diff = (mu_fg - mu_bg).norm();
            if var > 0.0 {
                diff / var.sqrt()
            } else if diff > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        })
        .collect())
}

/// Select the frequency channels used for reconstruction.
///
/// Fails with [`RecoError::EmptySelection`] when no channel survives.
pub fn select_frequencies(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    filter: &FrequencyFilter,
) -> Result<FrequencySelection, RecoError> {
    let (first, rest) = calibrations
        .split_first()
        .ok_or_else(|| RecoError::Configuration("no calibration source given".into()))?;

    let mut selection = calibration_channels(*first, filter);
    for source in rest {
        selection = selection.intersect(&calibration_channels(*source, filter));
    }
    selection = selection.retain(|c| measurement.has_channel(c));

    if let Some(variance) = &filter.variance {
        if !selection.is_empty() {
            let scores = variance_scores(measurement, selection.channels(), variance)?;
            let keep: Vec<ChannelIndex> = selection
                .channels()
                .iter()
                .zip(scores)
                .filter(|(_, s)| *s > variance.threshold)
                .map(|(c, _)| *c)
                .collect();
            selection = FrequencySelection::new(keep);
        }
    }

    if selection.is_empty() {
        return Err(RecoError::EmptySelection(format!(
            "min_freq={}, max_freq={:?}, snr_thresh={:?}, rec_channels={:?}",
            filter.min_freq, filter.max_freq, filter.snr_thresh, filter.rec_channels
        )));
    }
    log::info!("Selected {} frequency channels", selection.len());
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use ndarray::Array2;

    /// Calibration described only by its frequencies and SNR table.
    struct Table {
        freqs: Vec<f64>,
        snr: Array2<f64>,
    }

    impl Table {
        fn single(snr: &[f64]) -> Self {
            Self {
                freqs: (0..snr.len()).map(|b| 1e4 * (b + 1) as f64).collect(),
                snr: Array2::from_shape_vec((snr.len(), 1), snr.to_vec()).unwrap(),
            }
        }
    }

    impl CalibrationSource for Table {
        fn frequency_count(&self) -> usize {
            self.freqs.len()
        }
        fn receive_channels(&self) -> usize {
            self.snr.ncols()
        }
        fn frequencies(&self) -> Vec<f64> {
            self.freqs.clone()
        }
        fn snr(&self) -> Array2<f64> {
            self.snr.clone()
        }
        fn grid_shape(&self) -> [usize; 3] {
            [1, 1, 1]
        }
        fn field_of_view(&self) -> [f64; 3] {
            [1.0; 3]
        }
        fn system_matrix(&self, channels: &[ChannelIndex]) -> Result<Array2<Complex64>, SourceError> {
            Ok(Array2::zeros((1, channels.len())))
        }
    }

    /// Receiver-0 measurement, one period; `data[bin][frame]`.
    struct Series {
        data: Vec<Vec<f64>>,
    }

    impl MeasurementSource for Series {
        fn frequency_count(&self) -> usize {
            self.data.len()
        }
        fn receive_channels(&self) -> usize {
            1
        }
        fn frequencies(&self) -> Vec<f64> {
            (0..self.data.len()).map(|b| 1e4 * (b + 1) as f64).collect()
        }
        fn frame_count(&self) -> usize {
            self.data.first().map_or(0, |d| d.len())
        }
        fn periods_per_frame(&self) -> usize {
            1
        }
        fn cycle_duration(&self) -> f64 {
            1.0
        }
        fn focus_point(&self, _period: usize) -> [f64; 3] {
            [0.0; 3]
        }
        fn measurement(&self, channels: &[ChannelIndex], frames: Range<usize>) -> Result<Array3<Complex64>, SourceError> {
            Ok(Array3::from_shape_fn((channels.len(), 1, frames.len()), |(c, _, f)| {
                Complex64::new(self.data[channels[c].bin][frames.start + f], 0.0)
            }))
        }
    }

    fn filter() -> FrequencyFilter {
        FrequencyFilter {
            min_freq: 0.0,
            max_freq: None,
            snr_thresh: None,
            num_used_freqs: None,
            rec_channels: vec![0, 1],
            variance: None,
        }
    }

    fn bins(selection: &FrequencySelection) -> Vec<usize> {
        selection.channels().iter().map(|c| c.bin).collect()
    }

    #[test]
    fn test_rec_channels_restrict_receivers() {
        let source = Table {
            freqs: vec![1e4, 2e4],
            snr: Array2::ones((2, 2)),
        };
        let selection = calibration_channels(&source, &FrequencyFilter { rec_channels: vec![1], ..filter() });
        assert_eq!(selection.channels(), &[ChannelIndex::new(1, 0), ChannelIndex::new(1, 1)]);
    }

    #[test]
    fn test_band_limits_are_inclusive() {
        let source = Table::single(&[1.0; 5]);
        let band = FrequencyFilter {
            min_freq: 2e4,
            max_freq: Some(4e4),
            ..filter()
        };
        assert_eq!(bins(&calibration_channels(&source, &band)), vec![1, 2, 3]);
    }

    #[test]
    fn test_snr_threshold_drops_weak_channels() {
        let source = Table::single(&[3.0, 7.0, 5.0, 1.0]);
        let strong = FrequencyFilter {
            snr_thresh: Some(5.0),
            ..filter()
        };
        assert_eq!(bins(&calibration_channels(&source, &strong)), vec![1, 2]);
    }

    #[test]
    fn test_top_k_breaks_ties_by_linear_order() {
        let source = Table::single(&[3.0, 7.0, 7.0, 1.0]);
        let top = |k| FrequencyFilter {
            num_used_freqs: Some(k),
            ..filter()
        };
        assert_eq!(bins(&calibration_channels(&source, &top(2))), vec![1, 2]);
        assert_eq!(bins(&calibration_channels(&source, &top(1))), vec![1]);
        assert_eq!(bins(&calibration_channels(&source, &top(3))), vec![0, 1, 2]);
    }

    #[test]
    fn test_variance_filter_scores_foreground_against_background() {
        // Frames 0..2 foreground, 2..4 background.
        let measurement = Series {
            data: vec![
                vec![5.0, 5.0, 1.0, 1.0], // flat background, shifted foreground
                vec![2.0, 2.0, 2.0, 2.0], // constant
                vec![1.1, 1.1, 0.0, 2.0], // score 0.1
            ],
        };
        let source = Table::single(&[10.0; 3]);
        let variance = FrequencyFilter {
            variance: Some(VarianceFilter {
                threshold: 0.5,
                fg_frames: 0..2,
                bg_frames: 2..4,
            }),
            ..filter()
        };
        let selection = select_frequencies(&[&source], &measurement, &variance).unwrap();
        assert_eq!(bins(&selection), vec![0]);

        let scores = variance_scores(&measurement, selection.channels(), variance.variance.as_ref().unwrap()).unwrap();
        assert!(scores[0].is_infinite());
    }

    #[test]
    fn test_intersection_across_calibrations() {
        let a = Table::single(&[10.0, 1.0, 10.0, 10.0]);
        let b = Table::single(&[10.0, 10.0, 1.0, 10.0]);
        let measurement = Series { data: vec![vec![0.0]; 4] };
        let strong = FrequencyFilter {
            snr_thresh: Some(5.0),
            ..filter()
        };
        let selection = select_frequencies(&[&a, &b], &measurement, &strong).unwrap();
        assert_eq!(bins(&selection), vec![0, 3]);
    }

    #[test]
    fn test_channels_missing_from_measurement_are_dropped() {
        let source = Table::single(&[10.0; 4]);
        let measurement = Series { data: vec![vec![0.0]; 2] };
        let selection = select_frequencies(&[&source], &measurement, &filter()).unwrap();
        assert_eq!(bins(&selection), vec![0, 1]);
    }

    #[test]
    fn test_nothing_left_is_empty_selection() {
        let source = Table::single(&[1.0, 2.0]);
        let measurement = Series { data: vec![vec![0.0]; 2] };
        let strong = FrequencyFilter {
            snr_thresh: Some(5.0),
            ..filter()
        };
        assert!(matches!(
            select_frequencies(&[&source], &measurement, &strong),
            Err(RecoError::EmptySelection(_))
        ));
    }
}
