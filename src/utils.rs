//! Device selection, precision resolution and logging setup

use candle_core::Device;
use candle_nn::VarMap;
use tracing::{info, warn};

use crate::config::Precision;
use crate::error::{Error, Result};

/// Device specification parsed from the `gpus` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Host CPU
    Cpu,
    /// CUDA ordinal
    Cuda(usize),
    /// Metal ordinal
    Metal(usize),
}

impl DeviceSpec {
    /// Parse `cpu`, `cuda:N`, `metal:N` or a comma-separated ordinal list
    /// such as `0,1` (the first ordinal is used)
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim().to_ascii_lowercase();
        if spec.is_empty() || spec == "cpu" || spec == "-1" {
            return Ok(DeviceSpec::Cpu);
        }

        let ordinal = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| Error::config(format!("invalid device ordinal '{}'", s)))
        };

        if let Some(rest) = spec.strip_prefix("cuda:") {
            return Ok(DeviceSpec::Cuda(ordinal(rest)?));
        }
        if let Some(rest) = spec.strip_prefix("metal:") {
            return Ok(DeviceSpec::Metal(ordinal(rest)?));
        }

        let ordinals = spec
            .split(',')
            .map(ordinal)
            .collect::<Result<Vec<usize>>>()?;
        if ordinals.len() > 1 {
            warn!(
                "{} devices requested, training runs on device {} only",
                ordinals.len(),
                ordinals[0]
            );
        }
        Ok(DeviceSpec::Cuda(ordinals[0]))
    }
}

/// Open the device named by `gpus`, falling back to the CPU when the
/// requested backend is not compiled in or not available
pub fn select_device(gpus: &str) -> Result<Device> {
    let spec = DeviceSpec::parse(gpus)?;
    let device = match spec {
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Cuda(ordinal) => Device::cuda_if_available(ordinal)?,
        DeviceSpec::Metal(ordinal) => Device::metal_if_available(ordinal)?,
    };

    if device.is_cpu() && spec != DeviceSpec::Cpu {
        warn!("Requested device '{}' unavailable, using CPU", gpus);
    }
    info!("Using device {:?}", device);
    Ok(device)
}

/// Precision actually used for `precision` on `device`; half precisions fall
/// back to f32 on the CPU
pub fn resolve_precision(precision: Precision, device: &Device) -> Precision {
    if device.is_cpu() && precision != Precision::F32 {
        warn!("{:?} precision is not supported on CPU, training in f32", precision);
        return Precision::F32;
    }
    precision
}

/// Total number of scalar parameters in `var_map`
pub fn count_parameters(var_map: &VarMap) -> usize {
    var_map
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}

/// Install the global tracing subscriber
pub fn init_logging(default_filter: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use candle_core::DType;
    use test_case::test_case;

    #[test_case("cpu", DeviceSpec::Cpu ; "cpu")]
    #[test_case("", DeviceSpec::Cpu ; "empty")]
    #[test_case("-1", DeviceSpec::Cpu ; "minus one")]
    #[test_case("0", DeviceSpec::Cuda(0) ; "single ordinal")]
    #[test_case("2,3", DeviceSpec::Cuda(2) ; "first of list")]
    #[test_case("cuda:1", DeviceSpec::Cuda(1) ; "cuda prefix")]
    #[test_case("metal:0", DeviceSpec::Metal(0) ; "metal prefix")]
    fn test_parse_device_spec(spec: &str, expected: DeviceSpec) {
        assert_eq!(DeviceSpec::parse(spec).unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeviceSpec::parse("gpu0").is_err());
        assert!(DeviceSpec::parse("cuda:x").is_err());
    }

    #[test]
    fn test_cpu_forces_f32() {
        assert_eq!(resolve_precision(Precision::F16, &Device::Cpu), Precision::F32);
        assert_eq!(resolve_precision(Precision::Bf16, &Device::Cpu), Precision::F32);
        assert_eq!(resolve_precision(Precision::F32, &Device::Cpu), Precision::F32);
    }

    #[test]
    fn test_count_parameters() {
        let var_map = VarMap::new();
        var_map
            .get((3, 4), "w", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        var_map
            .get(4, "b", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(count_parameters(&var_map), 16);
    }
}
