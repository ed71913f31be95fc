/// Channel remix matrix applied across output streams before mixing.
///
/// Installed globally on the worker via `ConfigGlobalRemix`; the io pump
/// runs every playback buffer through it.
#[derive(Clone, Debug, PartialEq)]
pub struct RemixConverter {
    num_channels: usize,
    matrix: Vec<f32>,
}

impl RemixConverter {
    /// Builds a converter from a row-major `num_channels` x `num_channels`
    /// coefficient matrix. Returns `None` for an identity matrix (or a
    /// malformed one), meaning no remix should be installed.
    pub fn from_coefficients(num_channels: usize, coefficients: &[f32]) -> Option<RemixConverter> {
        if coefficients.len() != num_channels * num_channels {
            return None;
        }

        let identity = (0..num_channels).all(|row| {
            (0..num_channels).all(|col| {
                let expect = if row == col { 1.0 } else { 0.0 };
                coefficients[row * num_channels + col] == expect
            })
        });

        if identity {
            return None;
        }

        Some(RemixConverter {
            num_channels,
            matrix: coefficients.to_vec(),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Remix interleaved frames in place. Trailing samples short of a whole
    /// frame are left untouched.
    pub fn apply(&self, samples: &mut [f32]) {
        let mut mixed = vec![0.0f32; self.num_channels];

        for frame in samples.chunks_exact_mut(self.num_channels) {
            for (out, row) in mixed.iter_mut().zip(self.matrix.chunks(self.num_channels)) {
                *out = row.iter().zip(frame.iter()).map(|(c, s)| c * s).sum();
            }
            frame.copy_from_slice(&mixed);
        }
    }
}
