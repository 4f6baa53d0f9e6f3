use std::fmt;

/// Where the pipeline runs: forced onto the CPU, or on the accelerator with the given ordinal
/// (falling back to the CPU when no accelerator is compiled in).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    pub fn from_flags(cpu: bool, ordinal: usize) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_flag_wins_over_ordinal() {
        assert_eq!(DeviceMap::from_flags(true, 3), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_flags(false, 3), DeviceMap::Ordinal(3));
        assert_eq!(DeviceMap::default().to_string(), "gpu:0");
    }
}
