use std::fmt;
use std::io;
use thiserror::Error;

/// Error types for gateway discovery and control
#[derive(Debug, Error)]
pub enum NatError {
    /// UPnP IGD errors
    #[error("UPnP error: {0}")]
    Upnp(#[from] UpnpError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No usable local IPv4 address
    #[error("No usable local IPv4 address")]
    NoLocalAddress,
}

/// UPnP IGD specific errors
#[derive(Debug, Error)]
pub enum UpnpError {
    /// Discovery concluded without a gateway
    #[error("No UPnP gateway found on network")]
    NoGatewayFound,

    /// Discovery has not produced a gateway yet
    #[error("UPnP gateway is not available")]
    Unavailable,

    /// Description document is not an Internet Gateway Device
    #[error("Device {0} is not an InternetGatewayDevice")]
    NotIgdDevice(String),

    /// Neither WANIPConnection nor WANPPPConnection advertised
    #[error("No WANIPConnection or WANPPPConnection service found")]
    NoUsableService,

    /// SOAP fault with error code
    #[error("SOAP fault {code}: {description}")]
    SoapFault { code: u16, description: String },

    /// HTTP error
    #[error("HTTP error {code}: {reason}")]
    HttpError { code: u16, reason: String },

    /// Request could not be delivered
    #[error("HTTP transport error: {0}")]
    Transport(String),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    XmlParseError(String),

    /// Expected response node missing
    #[error("Missing field {0} in response")]
    MissingField(String),

    /// Invalid response
    #[error("Invalid UPnP response: {0}")]
    InvalidResponse(String),
}

/// UPnP error codes from the IGD control specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpnpErrorCode {
    /// Invalid action
    InvalidAction = 401,

    /// Invalid args
    InvalidArgs = 402,

    /// Action failed
    ActionFailed = 501,

    /// Argument value invalid
    ArgumentValueInvalid = 600,

    /// Argument value out of range
    ArgumentValueOutOfRange = 601,

    /// Optional action not implemented
    OptionalActionNotImplemented = 602,

    /// Action not authorized
    ActionNotAuthorized = 606,

    /// Port mapping not found
    NoSuchEntryInArray = 714,

    /// Wild card not permitted in source IP
    WildCardNotPermittedInSrcIp = 715,

    /// Wild card not permitted in external port
    WildCardNotPermittedInExtPort = 716,

    /// Port mapping conflict
    ConflictInMappingEntry = 718,

    /// Same port values required
    SamePortValuesRequired = 724,

    /// Only permanent lease supported
    OnlyPermanentLeaseSupported = 725,

    /// Remote host only supports wildcard
    RemoteHostOnlySupportsWildcard = 726,

    /// External port only supports wildcard
    ExternalPortOnlySupportsWildcard = 727,
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAction => write!(f, "Invalid Action"),
            Self::InvalidArgs => write!(f, "Invalid Arguments"),
            Self::ActionFailed => write!(f, "Action Failed"),
            Self::ArgumentValueInvalid => write!(f, "Argument Value Invalid"),
            Self::ArgumentValueOutOfRange => write!(f, "Argument Value Out of Range"),
            Self::OptionalActionNotImplemented => write!(f, "Optional Action Not Implemented"),
            Self::ActionNotAuthorized => write!(f, "Action Not Authorized"),
            Self::NoSuchEntryInArray => write!(f, "No Such Entry In Array"),
            Self::WildCardNotPermittedInSrcIp => write!(f, "Wildcard Not Permitted in Source IP"),
            Self::WildCardNotPermittedInExtPort => write!(f, "Wildcard Not Permitted in External Port"),
            Self::ConflictInMappingEntry => write!(f, "Conflict in Mapping Entry"),
            Self::SamePortValuesRequired => write!(f, "Same Port Values Required"),
            Self::OnlyPermanentLeaseSupported => write!(f, "Only Permanent Lease Supported"),
            Self::RemoteHostOnlySupportsWildcard => write!(f, "Remote Host Only Supports Wildcard"),
            Self::ExternalPortOnlySupportsWildcard => write!(f, "External Port Only Supports Wildcard"),
        }
    }
}

impl UpnpErrorCode {
    /// Convert from u16 error code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(Self::InvalidAction),
            402 => Some(Self::InvalidArgs),
            501 => Some(Self::ActionFailed),
            600 => Some(Self::ArgumentValueInvalid),
            601 => Some(Self::ArgumentValueOutOfRange),
            602 => Some(Self::OptionalActionNotImplemented),
            606 => Some(Self::ActionNotAuthorized),
            714 => Some(Self::NoSuchEntryInArray),
            715 => Some(Self::WildCardNotPermittedInSrcIp),
            716 => Some(Self::WildCardNotPermittedInExtPort),
            718 => Some(Self::ConflictInMappingEntry),
            724 => Some(Self::SamePortValuesRequired),
            725 => Some(Self::OnlyPermanentLeaseSupported),
            726 => Some(Self::RemoteHostOnlySupportsWildcard),
            727 => Some(Self::ExternalPortOnlySupportsWildcard),
            _ => None,
        }
    }
}

impl UpnpError {
    /// Build a fault error, naming the code when it is a known IGD code
    pub fn fault(code: u16, description: impl Into<String>) -> Self {
        let description = description.into();
        let description = match UpnpErrorCode::from_code(code) {
            Some(known) if description.is_empty() => known.to_string(),
            _ => description,
        };
        Self::SoapFault { code, description }
    }

    /// Known IGD error code carried by a SOAP fault
    pub fn error_code(&self) -> Option<UpnpErrorCode> {
        match self {
            Self::SoapFault { code, .. } => UpnpErrorCode::from_code(*code),
            _ => None,
        }
    }
}

/// Result type for NAT operations
pub type NatResult<T> = Result<T, NatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_table() {
        assert_eq!(UpnpErrorCode::from_code(718), Some(UpnpErrorCode::ConflictInMappingEntry));
        assert_eq!(UpnpErrorCode::from_code(714), Some(UpnpErrorCode::NoSuchEntryInArray));
        assert_eq!(UpnpErrorCode::from_code(999), None);
    }

    #[test]
    fn test_fault_fills_known_description() {
        let err = UpnpError::fault(718, "");
        assert_eq!(err.to_string(), "SOAP fault 718: Conflict in Mapping Entry");
        assert_eq!(err.error_code(), Some(UpnpErrorCode::ConflictInMappingEntry));

        let err = UpnpError::fault(501, "Router busy");
        assert_eq!(err.to_string(), "SOAP fault 501: Router busy");
    }

    #[test]
    fn test_upnp_error_converts() {
        let err: NatError = UpnpError::NoGatewayFound.into();
        assert!(matches!(err, NatError::Upnp(UpnpError::NoGatewayFound)));
    }
}
