use std::{
    fmt::Display,
    iter::Sum,
    num::ParseIntError,
    ops::{Add, AddAssign, Mul, Sub},
    str::FromStr,
};

/// A storage size in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(pub u64);

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

impl From<u64> for Size {
    fn from(x: u64) -> Self {
        Size(x)
    }
}

impl Size {
    pub const ZERO: Size = Size(0);

    pub const fn from_kib(kib: u64) -> Self {
        Size(kib * KIB)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Size(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Size(gib * GIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Whole mebibytes, rounded down.
    pub fn mib(self) -> u64 {
        self.0 / MIB
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Rounds down to a whole multiple of `unit`. A zero unit leaves the size
    /// untouched.
    pub fn align_down(self, unit: Size) -> Size {
        if unit.0 == 0 {
            return self;
        }
        Size(self.0 - self.0 % unit.0)
    }

    /// Rounds up to a whole multiple of `unit`.
    pub fn align_up(self, unit: Size) -> Size {
        if unit.0 == 0 || self.0 % unit.0 == 0 {
            return self;
        }
        Size(self.0 - self.0 % unit.0 + unit.0)
    }

    /// Number of whole `unit`s that fit in this size.
    pub fn units_of(self, unit: Size) -> u64 {
        if unit.0 == 0 {
            return 0;
        }
        self.0 / unit.0
    }

    pub fn saturating_sub(self, other: Size) -> Size {
        Size(self.0.saturating_sub(other.0))
    }

    pub fn to_human_readable(&self) -> String {
        match self.0.trailing_zeros() {
            _ if self.0 == 0 => "0".to_owned(),
            0..=9 => format!("{}", self.0),
            10..=19 => format!("{}K", self.0 >> 10),
            20..=29 => format!("{}M", self.0 >> 20),
            30..=39 => format!("{}G", self.0 >> 30),
            _ => format!("{}T", self.0 >> 40),
        }
    }

    /// Parses sizes such as `1024`, `512K`, `500M`, `500MiB`, `2 GB` or
    /// `512B`. All suffixes are binary.
    pub fn from_human_readable(mut s: &str) -> Result<Self, ParseIntError> {
        s = s.trim();
        s = s
            .strip_suffix("iB")
            .or_else(|| s.strip_suffix('B'))
            .unwrap_or(s);
        let try_parse = |val: &str, shift: u8| Ok(Self(val.trim().parse::<u64>()? << shift));
        if let Some(p) = s.strip_suffix('K').or_else(|| s.strip_suffix('k')) {
            try_parse(p, 10)
        } else if let Some(p) = s.strip_suffix('M') {
            try_parse(p, 20)
        } else if let Some(p) = s.strip_suffix('G') {
            try_parse(p, 30)
        } else if let Some(p) = s.strip_suffix('T') {
            try_parse(p, 40)
        } else {
            try_parse(s, 0)
        }
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size(self.0 + rhs.0)
    }
}

impl AddAssign for Size {
    fn add_assign(&mut self, rhs: Size) {
        self.0 += rhs.0;
    }
}

/// Saturates at zero; sizes never go negative.
impl Sub for Size {
    type Output = Size;

    fn sub(self, rhs: Size) -> Size {
        self.saturating_sub(rhs)
    }
}

impl Mul<u64> for Size {
    type Output = Size;

    fn mul(self, rhs: u64) -> Size {
        Size(self.0 * rhs)
    }
}

impl Sum for Size {
    fn sum<I: Iterator<Item = Size>>(iter: I) -> Size {
        iter.fold(Size::ZERO, Add::add)
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

impl FromStr for Size {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s.trim())
    }
}

impl<'de> serde::Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Size, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Size may be provided as a string (e.g. "1K") or as a pure number
        // (e.g. 1024). Serde forces a number when only digits are provided, so
        // we need to deserialize as a generic value and then check the type.
        let value = serde_yaml::Value::deserialize(deserializer)?;

        match value {
            serde_yaml::Value::String(s) => Size::from_str(s.as_str())
                .map_err(|e| serde::de::Error::custom(format!("invalid size: {e}"))),
            serde_yaml::Value::Number(n) => {
                let n = n.as_u64().ok_or_else(|| {
                    serde::de::Error::custom("invalid size, expected unsigned integer")
                })?;
                Ok(Size(n))
            }
            _ => Err(serde::de::Error::custom("invalid size")),
        }
    }
}

impl serde::Serialize for Size {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.0 & 0x3FF != 0 {
            serializer.serialize_u64(self.0)
        } else {
            serializer.serialize_str(self.to_human_readable().as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string() {
        assert_eq!(Size::from_str("1").unwrap(), Size(1));
        assert_eq!(Size::from_str("20K").unwrap(), Size::from_kib(20));
        assert_eq!(Size::from_str("30M").unwrap(), Size::from_mib(30));
        assert_eq!(Size::from_str("40G").unwrap(), Size::from_gib(40));
        assert_eq!(Size::from_str("500MiB").unwrap(), Size::from_mib(500));
        assert_eq!(Size::from_str("2 GB").unwrap(), Size::from_gib(2));
        assert_eq!(Size::from_str("512B").unwrap(), Size(512));
        assert_eq!(Size::from_str(" 300 K ").unwrap(), Size::from_kib(300));

        assert!(Size::from_str("1.0").is_err());
        assert!(Size::from_str("1 0K").is_err());
        assert!(Size::from_str("1X").is_err());
        assert!(Size::from_str("X10K").is_err());
    }

    #[test]
    fn test_to_human_readable() {
        assert_eq!(Size(0).to_string(), "0");
        assert_eq!(Size(1023).to_string(), "1023");
        assert_eq!(Size(1024).to_string(), "1K");
        assert_eq!(Size::from_kib(512).to_string(), "512K");
        assert_eq!(Size::from_mib(2994).to_string(), "2994M");
        assert_eq!(Size::from_mib(1024).to_string(), "1G");
    }

    #[test]
    fn test_alignment() {
        let extent = Size::from_mib(32);
        assert_eq!(Size::from_mib(1000).align_down(extent), Size::from_mib(992));
        assert_eq!(Size::from_mib(1000).align_up(extent), Size::from_mib(1024));
        assert_eq!(Size::from_mib(992).align_up(extent), Size::from_mib(992));
        assert_eq!(Size::from_mib(1000).units_of(extent), 31);
        assert_eq!(Size::from_mib(5).align_down(Size::ZERO), Size::from_mib(5));

        let chunk = Size::from_kib(512);
        assert_eq!(
            (Size::from_mib(2994) + Size::from_kib(100)).align_down(chunk),
            Size::from_mib(2994)
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(Size::from_mib(2) - Size::from_mib(5), Size::ZERO);
        assert_eq!(Size::from_mib(998) * 3, Size::from_mib(2994));
        let total: Size = [Size::from_mib(1), Size::from_mib(2)].into_iter().sum();
        assert_eq!(total, Size::from_mib(3));
    }

    #[test]
    fn test_serialization() {
        #[derive(Debug, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
        struct TestStruct {
            size: Size,
        }

        let test_cases = [
            ("size: 512", Size(512), "size: 512"),
            ("size: 1024", Size(1024), "size: 1K"),
            ("size: 1000M", Size::from_mib(1000), "size: 1000M"),
            ("size: 1024M", Size::from_gib(1), "size: 1G"),
        ];

        for (input_yaml, expected, expected_yaml) in test_cases.iter() {
            let actual: TestStruct = serde_yaml::from_str(input_yaml).unwrap();
            assert_eq!(actual.size, *expected, "failed to deserialize '{input_yaml}'");

            let actual = serde_yaml::to_string(&actual).unwrap();
            assert_eq!(actual.trim(), *expected_yaml);
        }
    }
}
