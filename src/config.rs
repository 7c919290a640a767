//! Runtime parameters
//!
//! All knobs of the counter live in a single [`Params`] value, owned by the
//! caller and passed by reference into the pipeline. Nothing here is global;
//! after [`Params::validate`] succeeds the value is treated as read-only.

use std::path::PathBuf;

use crate::error::{ConfigError, Result};
use crate::kmer::KmerMode;

/// What is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountingMode {
    /// Single k-mers of `leader_len` bases
    Single,
    /// (leader, follower) k-mer pairs
    #[default]
    Pair,
}

/// Sequencing technology of the predefined CBC list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Technology {
    #[default]
    TenX,
    Visium,
}

/// Input file format. The FASTX readers detect the actual format from the
/// stream; the flag exists for interface compatibility and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    Fasta,
    #[default]
    Fastq,
}

/// Output format. Only `bkc` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Bkc,
    Splash,
}

/// Which side of each accepted input pair is exported for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFilteredInput {
    #[default]
    None,
    /// CBC+UMI reads only
    First,
    /// Biological reads only
    Second,
    Both,
}

impl ExportFilteredInput {
    pub fn wants_first(self) -> bool {
        matches!(self, Self::First | Self::Both)
    }
    pub fn wants_second(self) -> bool {
        matches!(self, Self::Second | Self::Both)
    }
}

/// Complete configuration of a counting run.
#[derive(Debug, Clone)]
pub struct Params {
    pub mode: CountingMode,
    pub canonical: bool,

    // k-mer geometry
    pub leader_len: usize,
    pub gap_len: usize,
    pub follower_len: usize,

    // barcode geometry
    pub cbc_len: usize,
    pub umi_len: usize,
    pub soft_cbc_umi_len_limit: usize,
    pub allow_strange_cbc_umi_reads: bool,

    // threading and output sharding
    pub n_threads: usize,
    pub n_splits: usize,
    pub zstd_level: i32,
    pub max_count: u64,
    pub max_records_in_buffer: usize,
    pub sample_id: u64,

    // leader filters
    pub poly_acgt_len: usize,
    pub artifacts_path: Option<PathBuf>,
    pub apply_filter_illumina_adapters: bool,

    // CBC allow-list
    pub predefined_cbc_path: Option<PathBuf>,
    pub technology: Technology,
    pub apply_cbc_correction: bool,

    // inputs and outputs
    pub input_pairs: Vec<(PathBuf, PathBuf)>,
    pub input_format: InputFormat,
    pub anchor_dict_path: Option<PathBuf>,
    pub output_name: String,
    pub output_format: OutputFormat,

    // diagnostics
    pub verbosity: usize,
    pub log_name: Option<PathBuf>,
    pub filtered_input_path: Option<PathBuf>,
    pub export_filtered_input: ExportFilteredInput,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            mode: CountingMode::Pair,
            canonical: false,
            leader_len: 8,
            gap_len: 0,
            follower_len: 27,
            cbc_len: 16,
            umi_len: 12,
            soft_cbc_umi_len_limit: 0,
            allow_strange_cbc_umi_reads: false,
            n_threads: 0,
            n_splits: 4,
            zstd_level: 3,
            max_count: 65_535,
            max_records_in_buffer: 1 << 14,
            sample_id: 0,
            poly_acgt_len: 0,
            artifacts_path: None,
            apply_filter_illumina_adapters: false,
            predefined_cbc_path: None,
            technology: Technology::TenX,
            apply_cbc_correction: false,
            input_pairs: Vec::new(),
            input_format: InputFormat::Fastq,
            anchor_dict_path: None,
            output_name: "bkc_out".to_string(),
            output_format: OutputFormat::Bkc,
            verbosity: 0,
            log_name: None,
            filtered_input_path: None,
            export_filtered_input: ExportFilteredInput::None,
        }
    }
}

fn check_range(name: &'static str, value: usize, min: usize, max: usize) -> Result<()> {
    if value < min || value > max {
        return Err(ConfigError::ValueOutOfRange {
            name,
            value,
            min,
            max,
        }
        .into());
    }
    Ok(())
}

impl Params {
    /// Validates all parameter values and option combinations.
    ///
    /// Must be called (and succeed) before the pipeline starts; the
    /// derived-width helpers assume validated values.
    pub fn validate(&self) -> Result<()> {
        check_range("leader_len", self.leader_len, 1, 32)?;
        check_range("gap_len", self.gap_len, 0, 256)?;
        check_range("cbc_len", self.cbc_len, 1, 32)?;
        check_range("umi_len", self.umi_len, 0, 32)?;
        check_range("n_splits", self.n_splits, 1, 256)?;
        check_range("zstd_level", self.zstd_level as usize, 0, 19)?;
        check_range("max_count", self.max_count as usize, 1, u32::MAX as usize)?;
        check_range(
            "max_records_in_buffer",
            self.max_records_in_buffer,
            1,
            1 << 24,
        )?;
        if self.mode == CountingMode::Pair {
            check_range("follower_len", self.follower_len, 1, 32)?;
            if self.canonical {
                return Err(ConfigError::CanonicalInPairMode.into());
            }
        }
        if self.apply_cbc_correction && self.predefined_cbc_path.is_none() {
            return Err(ConfigError::CorrectionWithoutAllowList.into());
        }
        if self.output_format == OutputFormat::Splash {
            return Err(ConfigError::UnsupportedOutputFormat.into());
        }
        if self.input_pairs.is_empty() {
            return Err(ConfigError::EmptyInputList.into());
        }
        if self.export_filtered_input != ExportFilteredInput::None
            && self.filtered_input_path.is_none()
        {
            return Err(ConfigError::MissingFilteredInputPath.into());
        }
        Ok(())
    }

    /// Number of counting worker threads, resolving 0 to the core count.
    pub fn worker_threads(&self) -> usize {
        if self.n_threads == 0 {
            num_cpus::get()
        } else {
            self.n_threads.min(num_cpus::get())
        }
    }

    /// K-mer value mode for the counting windows.
    pub fn kmer_mode(&self) -> KmerMode {
        if self.canonical {
            KmerMode::Canonical
        } else {
            KmerMode::Direct
        }
    }

    /// Shortest acceptable CBC+UMI read.
    pub fn cbc_umi_min_len(&self) -> usize {
        self.cbc_len + self.umi_len
    }

    /// Longest acceptable CBC+UMI read.
    pub fn cbc_umi_max_len(&self) -> usize {
        self.cbc_len + self.umi_len + self.soft_cbc_umi_len_limit
    }

    /// Bases a biological read must span to yield one candidate position.
    pub fn min_read_span(&self) -> usize {
        match self.mode {
            CountingMode::Single => self.leader_len,
            CountingMode::Pair => self.leader_len + self.gap_len + self.follower_len,
        }
    }

    pub fn sample_id_bytes(&self) -> usize {
        bytes_for_value(self.sample_id)
    }

    pub fn barcode_bytes(&self) -> usize {
        (2 * self.cbc_len).div_ceil(8)
    }

    pub fn leader_bytes(&self) -> usize {
        (2 * self.leader_len).div_ceil(8)
    }

    /// Zero in single mode: the follower field vanishes from the records.
    pub fn follower_bytes(&self) -> usize {
        match self.mode {
            CountingMode::Single => 0,
            CountingMode::Pair => (2 * self.follower_len).div_ceil(8),
        }
    }

    pub fn counter_bytes(&self) -> usize {
        bytes_for_value(self.max_count)
    }

    /// Total byte width of one packed output record.
    pub fn record_size(&self) -> usize {
        self.sample_id_bytes()
            + self.barcode_bytes()
            + self.leader_bytes()
            + self.follower_bytes()
            + self.counter_bytes()
    }
}

/// Smallest byte width that can hold `value` (at least 1).
fn bytes_for_value(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> Params {
        Params {
            input_pairs: vec![(PathBuf::from("a.fq"), PathBuf::from("b.fq"))],
            ..Params::default()
        }
    }

    #[test]
    fn test_default_params_validate() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn test_canonical_pair_rejected() {
        let params = Params {
            canonical: true,
            ..valid_params()
        };
        assert!(matches!(
            params.validate(),
            Err(crate::Error::ConfigError(ConfigError::CanonicalInPairMode))
        ));
    }

    #[test]
    fn test_canonical_single_accepted() {
        let params = Params {
            canonical: true,
            mode: CountingMode::Single,
            ..valid_params()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_leader_len_out_of_range() {
        let params = Params {
            leader_len: 33,
            ..valid_params()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_correction_requires_allow_list() {
        let params = Params {
            apply_cbc_correction: true,
            ..valid_params()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_splash_rejected() {
        let params = Params {
            output_format: OutputFormat::Splash,
            ..valid_params()
        };
        assert!(matches!(
            params.validate(),
            Err(crate::Error::ConfigError(ConfigError::UnsupportedOutputFormat))
        ));
    }

    #[test]
    fn test_bytes_for_value() {
        assert_eq!(bytes_for_value(0), 1);
        assert_eq!(bytes_for_value(255), 1);
        assert_eq!(bytes_for_value(256), 2);
        assert_eq!(bytes_for_value(65_535), 2);
        assert_eq!(bytes_for_value(65_536), 3);
    }

    #[test]
    fn test_field_widths() {
        let params = valid_params();
        // 16-base CBC packs into 4 bytes, 8-base leader into 2,
        // 27-base follower into 7, default max_count into 2
        assert_eq!(params.barcode_bytes(), 4);
        assert_eq!(params.leader_bytes(), 2);
        assert_eq!(params.follower_bytes(), 7);
        assert_eq!(params.counter_bytes(), 2);
        assert_eq!(params.record_size(), 1 + 4 + 2 + 7 + 2);
    }

    #[test]
    fn test_follower_width_zero_in_single_mode() {
        let params = Params {
            mode: CountingMode::Single,
            ..valid_params()
        };
        assert_eq!(params.follower_bytes(), 0);
    }
}
