use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;

/// Infrared protocols known to the firmware.
///
/// The discriminant is the id carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    Unknown = 0,
    Unused = 1,
    Rc5 = 2,
    Rc6 = 3,
    Nec = 4,
    Sony = 5,
    Panasonic = 6,
    Jvc = 7,
    Samsung = 8,
    Whynter = 9,
    AiwaRcT501 = 10,
    Lg = 11,
    Sanyo = 12,
    Mitsubishi = 13,
    Dish = 14,
    Sharp = 15,
    Denon = 16,
    Pronto = 17,
}

const PROTOCOLS: [(Protocol, &str); 18] = [
    (Protocol::Unknown, "UNKNOWN"),
    (Protocol::Unused, "UNUSED"),
    (Protocol::Rc5, "RC5"),
    (Protocol::Rc6, "RC6"),
    (Protocol::Nec, "NEC"),
    (Protocol::Sony, "SONY"),
    (Protocol::Panasonic, "PANASONIC"),
    (Protocol::Jvc, "JVC"),
    (Protocol::Samsung, "SAMSUNG"),
    (Protocol::Whynter, "WHYNTER"),
    (Protocol::AiwaRcT501, "AIWA_RC_T501"),
    (Protocol::Lg, "LG"),
    (Protocol::Sanyo, "SANYO"),
    (Protocol::Mitsubishi, "MITSUBISHI"),
    (Protocol::Dish, "DISH"),
    (Protocol::Sharp, "SHARP"),
    (Protocol::Denon, "DENON"),
    (Protocol::Pronto, "PRONTO"),
];

impl Protocol {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        PROTOCOLS[self as usize].1
    }

    /// Resolve a protocol token, ignoring case.
    pub fn from_name(name: &str) -> Option<Protocol> {
        PROTOCOLS
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(p, _)| *p)
    }

    /// `UNKNOWN` and `UNUSED` are placeholders, never something the transmitter can emit.
    pub fn is_sentinel(self) -> bool {
        matches!(self, Protocol::Unknown | Protocol::Unused)
    }

    pub fn all() -> impl Iterator<Item = Protocol> {
        PROTOCOLS.iter().map(|(p, _)| *p)
    }
}

impl TryFrom<u8> for Protocol {
    type Error = InvalidProtocolId;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        PROTOCOLS
            .get(usize::from(id))
            .map(|(p, _)| *p)
            .ok_or(InvalidProtocolId(id))
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::from_name(s).ok_or(UnknownProtocol)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown ir protocol")]
pub struct UnknownProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid ir protocol id {0}")]
pub struct InvalidProtocolId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseCodeError {
    #[error("expected `<protocol> <bits> <value>`")]
    Format,
    #[error(transparent)]
    UnknownProtocol(#[from] UnknownProtocol),
    #[error("invalid bit count")]
    Bits,
    #[error("invalid value")]
    Value,
}

/// One infrared signal.
///
/// Identity is the `(protocol id, bits, value)` triple.
#[derive(Debug, Clone, Copy)]
pub struct IrCode {
    protocol: Protocol,
    bits: u8,
    value: u32,
}

impl IrCode {
    pub const fn new(protocol: Protocol, bits: u8, value: u32) -> Self {
        IrCode {
            protocol,
            bits,
            value,
        }
    }

    /// Build a code from a protocol token such as `"samsung"`.
    pub fn with_protocol_name(name: &str, bits: u8, value: u32) -> Result<Self, UnknownProtocol> {
        Ok(IrCode::new(name.parse()?, bits, value))
    }

    /// Build a code from a numeric protocol id.
    pub fn with_protocol_id(id: u8, bits: u8, value: u32) -> Result<Self, InvalidProtocolId> {
        Ok(IrCode::new(Protocol::try_from(id)?, bits, value))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn tuple(&self) -> (u8, u8, u32) {
        (self.protocol.as_u8(), self.bits, self.value)
    }

    /// Renders the code the way the code files spell it, `SAMSUNG 32 0xE0E040BF`.
    pub fn to_config_line(&self) -> ConfigLine<'_> {
        ConfigLine(self)
    }
}

impl PartialEq for IrCode {
    fn eq(&self, other: &Self) -> bool {
        self.tuple() == other.tuple()
    }
}

impl Eq for IrCode {}

impl Hash for IrCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tuple().hash(state);
    }
}

impl fmt::Display for IrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IR(type={}, bits={}, value=0x{:08X})",
            self.protocol, self.bits, self.value
        )
    }
}

pub struct ConfigLine<'a>(&'a IrCode);

impl fmt::Display for ConfigLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} 0x{:08X}", self.0.protocol, self.0.bits, self.0.value)
    }
}

/// Parse a decimal number, or hex when prefixed with `0x`.
pub fn parse_value(s: &str) -> Option<u32> {
    match s.get(..2) {
        Some("0x") | Some("0X") => u32::from_str_radix(&s[2..], 16).ok(),
        _ => s.parse().ok(),
    }
}

impl FromStr for IrCode {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_ascii_whitespace();

        let (protocol, bits, value) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(p), Some(b), Some(v), None) => (p, b, v),
            _ => return Err(ParseCodeError::Format),
        };

        let protocol = protocol.parse::<Protocol>()?;
        let bits = bits.parse::<u8>().map_err(|_| ParseCodeError::Bits)?;
        let value = parse_value(value).ok_or(ParseCodeError::Value)?;

        Ok(IrCode::new(protocol, bits, value))
    }
}
