//! Configuration of PACE handshakes.
//!
//! A configuration is built once and then shared read-only between sessions, usually through an
//! [`Arc`](std::sync::Arc).


use std::ops::RangeInclusive;


/// Standardized domain parameter identifiers of the elliptic curves PACE may run on.
pub const SUPPORTED_PARAMETER_IDS: RangeInclusive<u8> = 10..=18;


/// When to reference the chosen domain parameters (tag `0x84`) in MSE:Set AT.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ParameterIdReference {
    /// Never send the parameter ID.
    Never,

    /// Send the parameter ID only if the card offers more than one PACE parameter set.
    #[default]
    WhenAmbiguous,

    /// Always send the parameter ID if it is known.
    Always,
}


/// Configuration options for PACE
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceConfig {
    /// Standardized domain parameter IDs to accept
    ///
    /// IDs outside [`SUPPORTED_PARAMETER_IDS`] are never accepted, even if listed.
    pub allowed_parameter_ids: Vec<u8>,

    /// When to reference the parameter ID in MSE:Set AT
    pub parameter_id_reference: ParameterIdReference,

    /// Whether the card must name a certification authority when a CHAT was sent
    pub require_car_with_chat: bool,

    /// Retry counter reported if the card does not report one itself
    pub default_retry_counter: u8,
}

impl Default for PaceConfig {
    fn default() -> Self {
        Self {
            allowed_parameter_ids: SUPPORTED_PARAMETER_IDS.collect(),
            parameter_id_reference: ParameterIdReference::WhenAmbiguous,
            require_car_with_chat: true,
            default_retry_counter: 3,
        }
    }
}

impl PaceConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accepted standardized domain parameter IDs
    pub fn with_allowed_parameter_ids(mut self, ids: impl IntoIterator<Item = u8>) -> Self {
        self.allowed_parameter_ids = ids.into_iter().collect();
        self
    }

    /// Set when to reference the parameter ID
    pub const fn with_parameter_id_reference(mut self, reference: ParameterIdReference) -> Self {
        self.parameter_id_reference = reference;
        self
    }

    /// Set whether a CAR is required when a CHAT was sent
    pub const fn with_require_car_with_chat(mut self, require: bool) -> Self {
        self.require_car_with_chat = require;
        self
    }

    /// Set the retry counter reported if the card does not report one
    pub const fn with_default_retry_counter(mut self, counter: u8) -> Self {
        self.default_retry_counter = counter;
        self
    }

    /// Whether the given standardized domain parameter ID may be used.
    pub fn is_parameter_id_allowed(&self, id: u8) -> bool {
        SUPPORTED_PARAMETER_IDS.contains(&id)
            && self.allowed_parameter_ids.contains(&id)
    }

    /// Whether MSE:Set AT should carry the parameter ID.
    pub fn should_reference_parameter_id(&self, ambiguous: bool) -> bool {
        match self.parameter_id_reference {
            ParameterIdReference::Never => false,
            ParameterIdReference::WhenAmbiguous => ambiguous,
            ParameterIdReference::Always => true,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{PaceConfig, ParameterIdReference};

    #[test]
    fn defaults() {
        let config = PaceConfig::default();
        assert!((10..=18).all(|id| config.is_parameter_id_allowed(id)));
        assert!(!config.is_parameter_id_allowed(9));
        assert!(!config.is_parameter_id_allowed(2));
        assert!(config.require_car_with_chat);
        assert_eq!(config.default_retry_counter, 3);
        assert!(!config.should_reference_parameter_id(false));
        assert!(config.should_reference_parameter_id(true));
    }

    #[test]
    fn allow_list_cannot_be_widened() {
        let config = PaceConfig::new()
            .with_allowed_parameter_ids([8, 12, 13])
            .with_parameter_id_reference(ParameterIdReference::Always);
        assert!(!config.is_parameter_id_allowed(8));
        assert!(config.is_parameter_id_allowed(12));
        assert!(!config.is_parameter_id_allowed(15));
        assert!(config.should_reference_parameter_id(false));
    }
}
