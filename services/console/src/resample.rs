use anyhow::Context;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Mono rate converter for arbitrary-length input.
///
/// The underlying resampler consumes fixed-size chunks, so input is buffered
/// until a full chunk is available. Equal rates pass samples through.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    chunk_size: usize,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let chunk_size = chunk_size.max(1);
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(
                create_resampler(in_rate as f64, out_rate as f64, chunk_size)
                    .with_context(|| format!("cannot resample {} Hz to {} Hz", in_rate, out_rate))?,
            )
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
            chunk_size,
        })
    }

    /// Feeds `samples` and returns every output sample that is ready.
    pub fn process(&mut self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            let mut frames = resampler.process(&[chunk], None)?;
            if let Some(channel) = frames.pop() {
                out.extend(channel);
            }
        }
        Ok(out)
    }

    /// Samples waiting for a full input chunk.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(16_000, 16_000, 160).unwrap();
        let input = [0.1f32, -0.2, 0.3];
        let output = resampler.process(&input).unwrap();
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(output.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 0.0);
        }
        assert_eq!(resampler.buffered(), 0);
    }

    #[test]
    fn test_partial_chunks_are_buffered() {
        let mut resampler = StreamResampler::new(48_000, 16_000, 480).unwrap();
        assert!(resampler.process(&[0.0; 300]).unwrap().is_empty());
        assert_eq!(resampler.buffered(), 300);

        let output = resampler.process(&[0.0; 300]).unwrap();
        assert!(!output.is_empty());
        assert_eq!(resampler.buffered(), 120);
    }

    #[test]
    fn test_upsampling_scales_length() {
        let mut resampler = StreamResampler::new(16_000, 24_000, 160).unwrap();
        let output = resampler.process(&vec![0.25f32; 1_600]).unwrap();
        // 1.5x, give or take the interpolator's start-up delay.
        assert!(
            (2_000..=2_800).contains(&output.len()),
            "unexpected length {}",
            output.len()
        );
    }
}
