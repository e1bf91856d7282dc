use std::fmt;

use candle_core::Device;

/// Where an engine puts its weights. Binding is cheap; the device itself is
/// only created when the models are loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    Metal(usize),
    Cuda(usize),
}

impl DeviceMap {
    pub fn create(&self) -> candle_core::Result<Device> {
        match *self {
            DeviceMap::Metal(ordinal) => Device::new_metal(ordinal),
            DeviceMap::Cuda(ordinal) => Device::new_cuda(ordinal),
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMap::Metal(ordinal) => write!(f, "metal:{ordinal}"),
            DeviceMap::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_device_string() {
        assert_eq!(DeviceMap::Metal(0).to_string(), "metal:0");
        assert_eq!(DeviceMap::Cuda(1).to_string(), "cuda:1");
    }
}
