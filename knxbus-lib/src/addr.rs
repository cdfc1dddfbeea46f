//! KNX device and group addressing.
//!
//! Both address kinds are 16-bit values; how the destination of a frame is
//! interpreted is decided by the group bit in the enclosing cEMI control
//! field, not by the value itself.

use std::fmt;
use std::str::FromStr;

use crate::error::KnxError;

/// Individual (physical) address, displayed `area.line.device`.
///
/// Layout: 4 bits area, 4 bits line, 8 bits device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    pub const fn new(area: u8, line: u8, device: u8) -> Self {
        Self(((area as u16 & 0x0F) << 12) | ((line as u16 & 0x0F) << 8) | device as u16)
    }

    pub const fn area(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub const fn line(self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    pub const fn device(self) -> u8 {
        self.0 as u8
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for IndividualAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<IndividualAddress> for u16 {
    fn from(addr: IndividualAddress) -> u16 {
        addr.0
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KnxError::InvalidAddress(s.to_string());
        let mut parts = s.split('.');
        let area: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let line: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let device: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() || area > 15 || line > 15 {
            return Err(bad());
        }
        Ok(Self::new(area, line, device))
    }
}

/// Group address, displayed `main/middle/sub` (three-level style).
///
/// Layout: 5 bits main, 3 bits middle, 8 bits sub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupAddress(u16);

impl GroupAddress {
    pub const fn new(main: u8, middle: u8, sub: u8) -> Self {
        Self(((main as u16 & 0x1F) << 11) | ((middle as u16 & 0x07) << 8) | sub as u16)
    }

    pub const fn main(self) -> u8 {
        (self.0 >> 11) as u8
    }

    pub const fn middle(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    pub const fn sub(self) -> u8 {
        self.0 as u8
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for GroupAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<GroupAddress> for u16 {
    fn from(addr: GroupAddress) -> u16 {
        addr.0
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KnxError::InvalidAddress(s.to_string());
        let mut parts = s.split('/');
        let main: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let middle: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let sub: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() || main > 31 || middle > 7 {
            return Err(bad());
        }
        Ok(Self::new(main, middle, sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn individual_parts() {
        let addr = IndividualAddress::from(0xD011);
        assert_eq!(addr.area(), 13);
        assert_eq!(addr.line(), 0);
        assert_eq!(addr.device(), 17);
        assert_eq!(addr.to_string(), "13.0.17");
    }

    #[test]
    fn individual_from_str() {
        let addr: IndividualAddress = "1.1.10".parse().unwrap();
        assert_eq!(addr, IndividualAddress::new(1, 1, 10));
        assert!("1.1".parse::<IndividualAddress>().is_err());
        assert!("16.0.1".parse::<IndividualAddress>().is_err());
        assert!("a.b.c".parse::<IndividualAddress>().is_err());
    }

    #[test]
    fn group_parts() {
        let addr = GroupAddress::new(1, 2, 3);
        assert_eq!(addr.raw(), 0x0A03);
        assert_eq!(addr.to_string(), "1/2/3");
    }

    #[test]
    fn group_from_str() {
        let addr: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!(addr.raw(), 0x0A03);
        assert!("32/0/1".parse::<GroupAddress>().is_err());
        assert!("1/8/1".parse::<GroupAddress>().is_err());
        assert!("1/2".parse::<GroupAddress>().is_err());
    }
}
