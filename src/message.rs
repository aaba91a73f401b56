use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Identifies one simulated process for the lifetime of a simulation.
pub type ProcessId = u32;

/// Snapshot round number. Rounds start at 1; 0 is used by messages that do
/// not belong to any round.
pub type Round = u32;

/// Routing and ordering information carried by every message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub source: ProcessId,
    pub source_port: u16,
    pub dest: ProcessId,
    pub dest_port: u16,
    pub round: Round,
    /// Lamport clock of the sender at send time
    pub clock: u64,
}

/// The closed set of message kinds the runtime dispatches on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Application traffic. `hops` is the remaining forwarding budget.
    Base { hops: u32, text: String },
    /// Chandy–Lamport marker carrying a share of the round's weight.
    Marker { weight: Weight },
    /// A completed local snapshot travelling back towards the initiator.
    Report {
        id: ProcessId,
        snapshot: String,
        weight: Weight,
    },
    /// Stops the reader that decodes it and the process that dispatches it.
    Terminate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Base,
    Marker,
    Report,
    Terminate,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Base => "base",
            MessageKind::Marker => "marker",
            MessageKind::Report => "report",
            MessageKind::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// A message as it travels on the wire. Immutable once built; the serialized
/// form is authoritative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    header: Header,
    #[serde(flatten)]
    payload: Payload,
}

impl Message {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> ProcessId {
        self.header.source
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Base { .. } => MessageKind::Base,
            Payload::Marker { .. } => MessageKind::Marker,
            Payload::Report { .. } => MessageKind::Report,
            Payload::Terminate => MessageKind::Terminate,
        }
    }

    pub fn is_terminate(&self) -> bool {
        matches!(self.payload, Payload::Terminate)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} r{} t{}",
            self.kind(),
            self.header.source,
            self.header.dest,
            self.header.round,
            self.header.clock
        )?;
        match &self.payload {
            Payload::Base { hops, text } => write!(f, " [{text} hops={hops}]"),
            Payload::Marker { weight } => write!(f, " [w={weight}]"),
            Payload::Report { id, weight, .. } => write!(f, " [id={id} w={weight}]"),
            Payload::Terminate => Ok(()),
        }
    }
}

/// An exact, non-negative rational weight.
///
/// Marker weights are repeatedly halved and divided by channel counts, which
/// quickly leaves the set of values a float represents exactly. Keeping the
/// fraction reduced makes "all weight has returned" an exact comparison with
/// [`Weight::ONE`]. On the wire a weight is the printable string `n/d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Weight {
    num: u128,
    den: u128,
}

impl Weight {
    pub const ZERO: Weight = Weight { num: 0, den: 1 };
    pub const ONE: Weight = Weight { num: 1, den: 1 };

    /// Returns `None` for a zero denominator.
    pub fn new(num: u128, den: u128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Self::reduced(num, den))
    }

    fn reduced(num: u128, den: u128) -> Self {
        if num == 0 {
            return Self::ZERO;
        }
        let g = gcd(num, den);
        Self {
            num: num / g,
            den: den / g,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    /// Divides the weight into `parts` equal shares and returns one share.
    pub fn divide(self, parts: u32) -> Option<Self> {
        if parts == 0 {
            return None;
        }
        let den = self.den.checked_mul(u128::from(parts))?;
        Some(Self::reduced(self.num, den))
    }

    pub fn half(self) -> Option<Self> {
        self.divide(2)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        let g = gcd(self.den, other.den);
        let lcm = (self.den / g).checked_mul(other.den)?;
        let lhs = self.num.checked_mul(lcm / self.den)?;
        let rhs = other.num.checked_mul(lcm / other.den)?;
        Some(Self::reduced(lhs.checked_add(rhs)?, lcm))
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl Default for Weight {
    fn default() -> Self {
        Self::ZERO
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid weight {0:?}")]
pub struct ParseWeightError(String);

impl FromStr for Weight {
    type Err = ParseWeightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseWeightError(s.to_owned());
        let (num, den) = match s.split_once('/') {
            Some((num, den)) => (num, den),
            None => (s, "1"),
        };
        let num = num.trim().parse::<u128>().map_err(|_| bad())?;
        let den = den.trim().parse::<u128>().map_err(|_| bad())?;
        Weight::new(num, den).ok_or_else(bad)
    }
}

impl TryFrom<String> for Weight {
    type Error = ParseWeightError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Weight> for String {
    fn from(weight: Weight) -> Self {
        weight.to_string()
    }
}
