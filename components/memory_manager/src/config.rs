//! Collector configuration.
//!
//! Defaults follow the translated-collector parameters: 4 KiB pages and a
//! small-request threshold of 35 words. Every field can be overridden from
//! the environment through [`GcConfig::from_env`] or loaded from JSON.

use crate::arena::PAGE_HEADER_SIZE;
use crate::error::{GcError, GcResult};
use crate::header::{HEADER_SIZE, WORD};
use serde::{Deserialize, Serialize};

/// Tunables of the allocator and of the collection triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Bytes per allocator page. Must be a power of two.
    pub page_size: usize,
    /// Bytes of the first arena; later arenas grow by 5/4.
    pub arena_size: usize,
    /// Largest request, header included, served by the page allocator.
    /// Bigger objects are allocated directly from the system allocator.
    pub small_request_threshold: usize,
    /// Bytes allocated since the last cycle that trigger the next one.
    pub nursery_size: usize,
    /// Lower bound of the old-generation size that triggers a major cycle.
    pub min_heap_size: usize,
    /// After a major cycle, the next one starts when the old generation has
    /// grown by this factor.
    pub major_collection_threshold: f64,
    /// Hard cap on arena plus large-object memory. `None` means unbounded.
    pub max_heap_size: Option<usize>,
    /// Zero the payload of every new object.
    pub zero_fill: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            page_size: 4096,
            arena_size: 64 * 4096,
            small_request_threshold: 35 * WORD,
            nursery_size: 4 * 1024 * 1024,
            min_heap_size: 8 * 1024 * 1024,
            major_collection_threshold: 1.82,
            max_heap_size: None,
            zero_fill: true,
        }
    }
}

impl GcConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> GcResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(GcError::InvalidConfig(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.small_request_threshold % WORD != 0 {
            return Err(GcError::InvalidConfig(format!(
                "small_request_threshold {} is not a multiple of {}",
                self.small_request_threshold, WORD
            )));
        }
        if self.small_request_threshold < HEADER_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "small_request_threshold {} cannot hold an object header",
                self.small_request_threshold
            )));
        }
        // A page must hold its header plus at least one block of the largest class.
        if PAGE_HEADER_SIZE + self.small_request_threshold > self.page_size {
            return Err(GcError::InvalidConfig(format!(
                "small_request_threshold {} too large for page_size {}",
                self.small_request_threshold, self.page_size
            )));
        }
        if self.arena_size < self.page_size {
            return Err(GcError::InvalidConfig(format!(
                "arena_size {} smaller than page_size {}",
                self.arena_size, self.page_size
            )));
        }
        if self.nursery_size == 0 {
            return Err(GcError::InvalidConfig("nursery_size is zero".to_string()));
        }
        if !(self.major_collection_threshold > 1.0) {
            return Err(GcError::InvalidConfig(format!(
                "major_collection_threshold {} must be greater than 1",
                self.major_collection_threshold
            )));
        }
        Ok(())
    }

    /// Default configuration overridden by `GC_*` environment variables.
    ///
    /// Recognised: `GC_PAGE_SIZE`, `GC_ARENA_SIZE`,
    /// `GC_SMALL_REQUEST_THRESHOLD`, `GC_NURSERY_SIZE`, `GC_MIN_HEAP_SIZE`,
    /// `GC_MAJOR_COLLECTION_THRESHOLD`, `GC_MAX_HEAP_SIZE`, `GC_ZERO_FILL`.
    /// Sizes accept `k`/`m`/`g` suffixes.
    pub fn from_env() -> GcResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GcResult<Self> {
        let mut config = GcConfig::default();
        let size = |key: &str, slot: &mut usize| -> GcResult<()> {
            if let Some(value) = lookup(key) {
                *slot = parse_size(&value).ok_or_else(|| {
                    GcError::InvalidConfig(format!("{key}={value:?} is not a size"))
                })?;
            }
            Ok(())
        };
        size("GC_PAGE_SIZE", &mut config.page_size)?;
        size("GC_ARENA_SIZE", &mut config.arena_size)?;
        size("GC_SMALL_REQUEST_THRESHOLD", &mut config.small_request_threshold)?;
        size("GC_NURSERY_SIZE", &mut config.nursery_size)?;
        size("GC_MIN_HEAP_SIZE", &mut config.min_heap_size)?;
        if let Some(value) = lookup("GC_MAX_HEAP_SIZE") {
            let max = parse_size(&value).ok_or_else(|| {
                GcError::InvalidConfig(format!("GC_MAX_HEAP_SIZE={value:?} is not a size"))
            })?;
            config.max_heap_size = Some(max);
        }
        if let Some(value) = lookup("GC_MAJOR_COLLECTION_THRESHOLD") {
            config.major_collection_threshold = value.trim().parse().map_err(|_| {
                GcError::InvalidConfig(format!(
                    "GC_MAJOR_COLLECTION_THRESHOLD={value:?} is not a number"
                ))
            })?;
        }
        if let Some(value) = lookup("GC_ZERO_FILL") {
            config.zero_fill = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(GcError::InvalidConfig(format!(
                        "GC_ZERO_FILL={value:?} is not a boolean"
                    )))
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON configuration. Missing fields take their
    /// default value.
    pub fn from_json(text: &str) -> GcResult<Self> {
        let config: GcConfig =
            serde_json::from_str(text).map_err(|e| GcError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses `123`, `64k`, `4M`, `1g` (binary multiples).
fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1024),
        'm' | 'M' => (&text[..text.len() - 1], 1024 * 1024),
        'g' | 'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(multiplier)
}
