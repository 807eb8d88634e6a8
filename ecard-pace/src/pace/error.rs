//! Errors that may occur while establishing a PACE channel.


use crate::crypt;
use crate::iso7816::apdu::{self, StatusWord};
use crate::iso7816::card::CommunicationError;
use crate::tlv;


const MINOR_IFDL: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/";
const MINOR_SAL_SECURITY_CONDITION: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#securityConditionNotSatisfied";
const MINOR_INTERNAL_ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#internalError";
const MINOR_PARAMETER_ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#parameterError";


/// The General Authenticate steps of PACE.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingPublicKeys,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}


#[derive(Clone, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum PaceError {
    #[error("invalid length: {0}")]
    InvalidLength(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("malformed TLV: {0}")]
    MalformedTlv(String),

    #[error("unsupported domain parameters: {0}")]
    UnsupportedDomainParameters(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("the card does not offer PACE")]
    NoPaceInfo,

    #[error("the password has been deactivated")]
    PasswordDeactivated,

    #[error("the password has been blocked")]
    PasswordBlocked,

    #[error("the password has been suspended")]
    PasswordSuspended,

    #[error("wrong password")]
    PasswordError,

    #[error("security violation")]
    SecurityViolation,

    #[error("authentication failed with status {status}")]
    AuthenticationFailed { status: StatusWord },

    #[error("operation {operation:?} failed with status {status}")]
    OperationFailed { operation: Operation, status: StatusWord },

    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("unknown error: {0}")]
    UnknownError(String),
}
impl PaceError {
    /// The eCard API minor result code matching this error.
    pub fn minor(&self) -> String {
        match self {
            Self::PasswordSuspended => format!("{}passwordSuspended", MINOR_IFDL),
            Self::PasswordBlocked => format!("{}passwordBlocked", MINOR_IFDL),
            Self::PasswordError => format!("{}passwordError", MINOR_IFDL),
            Self::PasswordDeactivated => format!("{}passwordDeactivated", MINOR_IFDL),
            Self::AuthenticationFailed { .. } => format!("{}authenticationFailed", MINOR_IFDL),
            Self::OperationFailed { .. } | Self::UnknownError(_) => format!("{}unknownError", MINOR_IFDL),
            Self::SecurityViolation => MINOR_SAL_SECURITY_CONDITION.to_owned(),
            Self::InvalidLength(_)
                | Self::MalformedResponse(_)
                | Self::MalformedTlv(_)
                | Self::CryptoFailure(_)
                | Self::NotImplemented(_)
                => MINOR_INTERNAL_ERROR.to_owned(),
            Self::UnsupportedDomainParameters(_)
                | Self::UnsupportedProtocol(_)
                | Self::NoPaceInfo
                => MINOR_PARAMETER_ERROR.to_owned(),
        }
    }

    /// Whether the error reflects the state of the password on the card.
    pub fn is_password_state(&self) -> bool {
        matches!(
            self,
            Self::PasswordDeactivated | Self::PasswordBlocked | Self::PasswordSuspended | Self::PasswordError
        )
    }
}
impl From<apdu::Error> for PaceError {
    fn from(value: apdu::Error) -> Self {
        match value {
            apdu::Error::InvalidLength { .. } => Self::InvalidLength(value.to_string()),
            apdu::Error::MalformedResponse { .. } | apdu::Error::MalformedCommand
                => Self::MalformedResponse(value.to_string()),
        }
    }
}
impl From<tlv::Error> for PaceError {
    fn from(value: tlv::Error) -> Self {
        Self::MalformedTlv(value.to_string())
    }
}
impl From<crypt::Error> for PaceError {
    fn from(value: crypt::Error) -> Self {
        Self::CryptoFailure(value.to_string())
    }
}
impl From<CommunicationError> for PaceError {
    fn from(value: CommunicationError) -> Self {
        match value {
            CommunicationError::Apdu(e) => e.into(),
            CommunicationError::Transport(e) => Self::UnknownError(e.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{Operation, PaceError};
    use crate::iso7816::apdu::StatusWord;
    use crate::iso7816::card::CommunicationError;

    #[test]
    fn minor_codes() {
        assert_eq!(
            PaceError::PasswordSuspended.minor(),
            "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/passwordSuspended",
        );
        assert_eq!(
            PaceError::AuthenticationFailed { status: StatusWord::new(0x63, 0x00) }.minor(),
            "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/authenticationFailed",
        );
        assert_eq!(
            PaceError::SecurityViolation.minor(),
            "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#securityConditionNotSatisfied",
        );
        assert_eq!(
            PaceError::OperationFailed { operation: Operation::ObtainNonce, status: StatusWord::new(0x6A, 0x80) }.minor(),
            "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/unknownError",
        );
        assert!(PaceError::UnsupportedDomainParameters("x".into()).minor().ends_with("#parameterError"));
        assert!(PaceError::MalformedTlv("x".into()).minor().ends_with("#internalError"));
    }

    #[test]
    fn transport_errors_are_unknown() {
        let error: PaceError = CommunicationError::Transport("reader unplugged".into()).into();
        assert_eq!(error, PaceError::UnknownError("reader unplugged".to_owned()));
    }

    #[test]
    fn messages_hide_security_details() {
        assert_eq!(PaceError::SecurityViolation.to_string(), "security violation");
        assert_eq!(
            PaceError::AuthenticationFailed { status: StatusWord::new(0x63, 0x00) }.to_string(),
            "authentication failed with status 6300",
        );
    }
}
