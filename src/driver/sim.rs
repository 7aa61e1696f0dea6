//! Simulated drivers that generate synthetic readings.
//!
//! These stand in for vendor hardware behind the [`Driver`] contract: a
//! tunable laser with an OPO piezo scan, a multi-channel wavelength meter,
//! and a pulse generator with photon-count readback. They validate attribute
//! ranges the way the real devices would, so client and server code exercise
//! the same error paths as a hardware deployment.

use crate::driver::{ConnectionParams, Driver, ParamValue};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;

/// Speed of light in nm·Hz, for wavelength/frequency conversion.
const C_NM_HZ: f64 = 2.997_924_58e17;

fn not_connected(name: &str, method: &str) -> LabError {
    LabError::Invocation {
        method: method.to_string(),
        message: format!("driver '{name}' is not connected"),
    }
}

fn unknown_attribute(attribute: &str) -> LabError {
    LabError::Invocation {
        method: format!("get/set {attribute}"),
        message: format!("unknown attribute '{attribute}'"),
    }
}

fn arg_f64(args: &[ParamValue], index: usize, method: &str) -> LabResult<f64> {
    args.get(index)
        .and_then(ParamValue::as_f64)
        .ok_or_else(|| LabError::Invocation {
            method: method.to_string(),
            message: format!("argument {index} must be a number"),
        })
}

// =============================================================================
// SimLaser
// =============================================================================

/// Tunable continuous-wave laser with OPO/SHG/pump power monitors and an OPO
/// piezo scan mode.
pub struct SimLaser {
    name: String,
    connected: bool,
    wavelength_nm: f64,
    power_setpoint_mw: f64,
    shutter_open: bool,
    piezo_scanning: bool,
    piezo_level: f64,
}

impl SimLaser {
    /// Wavelength tuning range of the OPO output, nm.
    pub const WAVELENGTH_RANGE_NM: (f64, f64) = (450.0, 650.0);
    /// Output power setpoint range, mW.
    pub const POWER_RANGE_MW: (f64, f64) = (0.0, 1000.0);

    /// Creates an unconnected laser named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: false,
            wavelength_nm: 550.0,
            power_setpoint_mw: 0.0,
            shutter_open: false,
            piezo_scanning: false,
            piezo_level: 50.0,
        }
    }

    fn status(&self) -> ParamValue {
        let mut rng = rand::thread_rng();
        // Monitor photodiodes jitter around the setpoint
        let mut jitter = |base: f64| base * (1.0 + rng.gen_range(-0.02..0.02));
        let mut map = HashMap::new();
        let emitted = if self.shutter_open {
            self.power_setpoint_mw
        } else {
            0.0
        };
        map.insert("opo_power_mw".into(), ParamValue::Float(jitter(emitted)));
        map.insert(
            "shg_power_mw".into(),
            ParamValue::Float(jitter(emitted * 0.4)),
        );
        map.insert(
            "pump_power_mw".into(),
            ParamValue::Float(jitter(1500.0)),
        );
        map.insert("locked".into(), ParamValue::Bool(!self.piezo_scanning));
        ParamValue::Map(map)
    }
}

#[async_trait]
impl Driver for SimLaser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, params: &ConnectionParams) -> LabResult<()> {
        let host = params
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LabError::DriverInit {
                driver: self.name.clone(),
                message: "missing 'host' connection parameter".to_string(),
            })?;
        tracing::info!(driver = %self.name, %host, "sim laser connected");
        self.connected = true;
        Ok(())
    }

    async fn call(&mut self, method: &str, args: &[ParamValue]) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, method));
        }
        match method {
            "get_status" => Ok(self.status()),
            "scan_opo_piezo" => {
                let min = arg_f64(args, 0, method)?;
                let max = arg_f64(args, 1, method)?;
                let _rate = arg_f64(args, 2, method)?;
                if !(0.0..=100.0).contains(&min) || !(0.0..=100.0).contains(&max) || min >= max {
                    return Err(LabError::Invocation {
                        method: method.to_string(),
                        message: format!("invalid piezo scan bounds {min}..{max}"),
                    });
                }
                self.piezo_scanning = true;
                Ok(ParamValue::Null)
            }
            "stop_opo_piezo" => {
                self.piezo_scanning = false;
                self.piezo_level = arg_f64(args, 0, method).unwrap_or(50.0);
                Ok(ParamValue::Null)
            }
            other => Err(LabError::Invocation {
                method: other.to_string(),
                message: "unknown method".to_string(),
            }),
        }
    }

    async fn get(&mut self, attribute: &str) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        match attribute {
            "wavelength" => Ok(ParamValue::Float(self.wavelength_nm)),
            "power" => Ok(ParamValue::Float(self.power_setpoint_mw)),
            "shutter" => Ok(ParamValue::Bool(self.shutter_open)),
            "piezo_level" => Ok(ParamValue::Float(self.piezo_level)),
            other => Err(unknown_attribute(other)),
        }
    }

    async fn set(&mut self, attribute: &str, value: ParamValue) -> LabResult<()> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        match attribute {
            "wavelength" => {
                let nm = value.as_f64().ok_or_else(|| LabError::Validation {
                    attribute: attribute.to_string(),
                    message: "wavelength must be a number".to_string(),
                })?;
                let (lo, hi) = Self::WAVELENGTH_RANGE_NM;
                if !(lo..=hi).contains(&nm) {
                    return Err(LabError::Validation {
                        attribute: attribute.to_string(),
                        message: format!("{nm} nm outside tuning range {lo}-{hi} nm"),
                    });
                }
                self.wavelength_nm = nm;
                Ok(())
            }
            "power" => {
                let mw = value.as_f64().ok_or_else(|| LabError::Validation {
                    attribute: attribute.to_string(),
                    message: "power must be a number".to_string(),
                })?;
                let (lo, hi) = Self::POWER_RANGE_MW;
                if !(lo..=hi).contains(&mw) {
                    return Err(LabError::Validation {
                        attribute: attribute.to_string(),
                        message: format!("{mw} mW outside range {lo}-{hi} mW"),
                    });
                }
                self.power_setpoint_mw = mw;
                Ok(())
            }
            "shutter" => {
                self.shutter_open = value.as_bool().ok_or_else(|| LabError::Validation {
                    attribute: attribute.to_string(),
                    message: "shutter must be a bool".to_string(),
                })?;
                Ok(())
            }
            other => Err(unknown_attribute(other)),
        }
    }

    async fn close(&mut self) -> LabResult<()> {
        if self.connected {
            // Safe state: shutter closed, piezo parked, before dropping the link
            self.shutter_open = false;
            self.piezo_scanning = false;
            self.connected = false;
            tracing::info!(driver = %self.name, "sim laser closed");
        }
        Ok(())
    }
}

// =============================================================================
// SimWavemeter
// =============================================================================

/// Multi-channel wavelength meter. Channels report a slowly drifting
/// wavelength around a per-channel center.
pub struct SimWavemeter {
    name: String,
    connected: bool,
    channels: usize,
    centers_nm: Vec<f64>,
    exposure_ms: Vec<f64>,
}

impl SimWavemeter {
    /// Maximum channel count of the simulated unit.
    pub const MAX_CHANNELS: usize = 8;

    /// Creates an unconnected wavemeter named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: false,
            channels: Self::MAX_CHANNELS,
            centers_nm: Vec::new(),
            exposure_ms: Vec::new(),
        }
    }

    fn parse_channel<'a>(&self, attribute: &'a str) -> Option<(usize, &'a str)> {
        // Attributes look like "ch3_wavelength"
        let rest = attribute.strip_prefix("ch")?;
        let (index, field) = rest.split_once('_')?;
        let index: usize = index.parse().ok()?;
        if index == 0 || index > self.channels {
            return None;
        }
        Some((index - 1, field))
    }
}

#[async_trait]
impl Driver for SimWavemeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, params: &ConnectionParams) -> LabResult<()> {
        let channels = params
            .get("channels")
            .and_then(toml::Value::as_integer)
            .unwrap_or(Self::MAX_CHANNELS as i64);
        if !(1..=Self::MAX_CHANNELS as i64).contains(&channels) {
            return Err(LabError::DriverInit {
                driver: self.name.clone(),
                message: format!("channel count {channels} outside 1-{}", Self::MAX_CHANNELS),
            });
        }
        self.channels = channels as usize;
        self.centers_nm = (0..self.channels).map(|i| 600.0 + 10.0 * i as f64).collect();
        self.exposure_ms = vec![100.0; self.channels];
        self.connected = true;
        tracing::info!(driver = %self.name, channels = self.channels, "sim wavemeter connected");
        Ok(())
    }

    async fn call(&mut self, method: &str, _args: &[ParamValue]) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, method));
        }
        match method {
            "version" => Ok(ParamValue::String("8.4.1.0".to_string())),
            other => Err(LabError::Invocation {
                method: other.to_string(),
                message: "unknown method".to_string(),
            }),
        }
    }

    async fn get(&mut self, attribute: &str) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        let (channel, field) = self
            .parse_channel(attribute)
            .ok_or_else(|| unknown_attribute(attribute))?;
        let drift = rand::thread_rng().gen_range(-0.0005..0.0005);
        let wavelength = self.centers_nm[channel] + drift;
        match field {
            "wavelength" => Ok(ParamValue::Float(wavelength)),
            "frequency" => Ok(ParamValue::Float(C_NM_HZ / wavelength)),
            "exposure_ms" => Ok(ParamValue::Float(self.exposure_ms[channel])),
            _ => Err(unknown_attribute(attribute)),
        }
    }

    async fn set(&mut self, attribute: &str, value: ParamValue) -> LabResult<()> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        let (channel, field) = self
            .parse_channel(attribute)
            .ok_or_else(|| unknown_attribute(attribute))?;
        match field {
            "exposure_ms" => {
                let ms = value.as_f64().ok_or_else(|| LabError::Validation {
                    attribute: attribute.to_string(),
                    message: "exposure must be a number".to_string(),
                })?;
                if !(1.0..=2000.0).contains(&ms) {
                    return Err(LabError::Validation {
                        attribute: attribute.to_string(),
                        message: format!("{ms} ms outside range 1-2000 ms"),
                    });
                }
                self.exposure_ms[channel] = ms;
                Ok(())
            }
            _ => Err(unknown_attribute(attribute)),
        }
    }

    async fn close(&mut self) -> LabResult<()> {
        self.connected = false;
        Ok(())
    }
}

// =============================================================================
// SimPulseGen
// =============================================================================

/// Pulse generator with named sequence upload and photon-count readback.
pub struct SimPulseGen {
    name: String,
    connected: bool,
    sequences: HashMap<String, usize>,
    running: Option<String>,
    sample_rate_hz: f64,
}

impl SimPulseGen {
    /// Creates an unconnected pulse generator named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: false,
            sequences: HashMap::new(),
            running: None,
            sample_rate_hz: 1.0e9,
        }
    }
}

#[async_trait]
impl Driver for SimPulseGen {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, _params: &ConnectionParams) -> LabResult<()> {
        self.connected = true;
        tracing::info!(driver = %self.name, "sim pulse generator connected");
        Ok(())
    }

    async fn call(&mut self, method: &str, args: &[ParamValue]) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, method));
        }
        match method {
            "upload" => {
                let seq_name = args
                    .first()
                    .and_then(ParamValue::as_str)
                    .ok_or_else(|| LabError::Invocation {
                        method: method.to_string(),
                        message: "argument 0 must be the sequence name".to_string(),
                    })?;
                let steps = match args.get(1) {
                    Some(ParamValue::List(steps)) => steps.len(),
                    _ => {
                        return Err(LabError::Invocation {
                            method: method.to_string(),
                            message: "argument 1 must be the step list".to_string(),
                        })
                    }
                };
                self.sequences.insert(seq_name.to_string(), steps);
                Ok(ParamValue::Int(steps as i64))
            }
            "start" => {
                let seq_name = args
                    .first()
                    .and_then(ParamValue::as_str)
                    .ok_or_else(|| LabError::Invocation {
                        method: method.to_string(),
                        message: "argument 0 must be the sequence name".to_string(),
                    })?;
                if !self.sequences.contains_key(seq_name) {
                    return Err(LabError::Invocation {
                        method: method.to_string(),
                        message: format!("no uploaded sequence named '{seq_name}'"),
                    });
                }
                self.running = Some(seq_name.to_string());
                Ok(ParamValue::Null)
            }
            "stop" => {
                self.running = None;
                Ok(ParamValue::Null)
            }
            "count" => {
                // Dark counts only while no sequence is streaming
                let base = if self.running.is_some() { 12_000 } else { 200 };
                let counts = rand::thread_rng().gen_range(0..base) + base;
                Ok(ParamValue::Int(counts))
            }
            other => Err(LabError::Invocation {
                method: other.to_string(),
                message: "unknown method".to_string(),
            }),
        }
    }

    async fn get(&mut self, attribute: &str) -> LabResult<ParamValue> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        match attribute {
            "running" => Ok(ParamValue::Bool(self.running.is_some())),
            "sample_rate_hz" => Ok(ParamValue::Float(self.sample_rate_hz)),
            other => Err(unknown_attribute(other)),
        }
    }

    async fn set(&mut self, attribute: &str, value: ParamValue) -> LabResult<()> {
        if !self.connected {
            return Err(not_connected(&self.name, attribute));
        }
        match attribute {
            "sample_rate_hz" => {
                let hz = value.as_f64().ok_or_else(|| LabError::Validation {
                    attribute: attribute.to_string(),
                    message: "sample rate must be a number".to_string(),
                })?;
                if !(1.0..=1.25e9).contains(&hz) {
                    return Err(LabError::Validation {
                        attribute: attribute.to_string(),
                        message: format!("{hz} Hz outside range 1 Hz-1.25 GHz"),
                    });
                }
                self.sample_rate_hz = hz;
                Ok(())
            }
            other => Err(unknown_attribute(other)),
        }
    }

    async fn close(&mut self) -> LabResult<()> {
        if self.connected {
            // Outputs must be idle before the link drops
            self.running = None;
            self.connected = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, toml::Value)]) -> ConnectionParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_laser_wavelength_validation() {
        let mut laser = SimLaser::new("cwave");
        laser
            .open(&params(&[("host", toml::Value::String("10.0.0.1".into()))]))
            .await
            .unwrap();

        laser
            .set("wavelength", ParamValue::Float(620.0))
            .await
            .unwrap();
        assert_eq!(
            laser.get("wavelength").await.unwrap(),
            ParamValue::Float(620.0)
        );

        let err = laser.set("wavelength", ParamValue::Float(1064.0)).await;
        assert!(matches!(err, Err(LabError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_laser_open_requires_host() {
        let mut laser = SimLaser::new("cwave");
        let err = laser.open(&ConnectionParams::new()).await.unwrap_err();
        assert!(matches!(err, LabError::DriverInit { .. }));
        // close after failed open must be safe
        laser.close().await.unwrap();
        laser.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_laser_status_tracks_shutter() {
        let mut laser = SimLaser::new("cwave");
        laser
            .open(&params(&[("host", toml::Value::String("10.0.0.1".into()))]))
            .await
            .unwrap();
        laser
            .set("power", ParamValue::Float(500.0))
            .await
            .unwrap();

        // Shutter closed: monitors read zero regardless of setpoint.
        let status = laser.call("get_status", &[]).await.unwrap();
        let map = match status {
            ParamValue::Map(map) => map,
            other => panic!("expected map, got {other:?}"),
        };
        assert_eq!(map.get("opo_power_mw"), Some(&ParamValue::Float(0.0)));

        laser.set("shutter", ParamValue::Bool(true)).await.unwrap();
        let status = laser.call("get_status", &[]).await.unwrap();
        let map = match status {
            ParamValue::Map(map) => map,
            other => panic!("expected map, got {other:?}"),
        };
        match map.get("opo_power_mw") {
            Some(ParamValue::Float(mw)) => {
                assert!((mw - 500.0).abs() <= 500.0 * 0.02, "out of band: {mw}");
            }
            other => panic!("expected jittered power reading, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_laser_close_shuts_shutter() {
        let mut laser = SimLaser::new("cwave");
        laser
            .open(&params(&[("host", toml::Value::String("10.0.0.1".into()))]))
            .await
            .unwrap();
        laser.set("shutter", ParamValue::Bool(true)).await.unwrap();
        laser.close().await.unwrap();
        assert!(!laser.shutter_open);
    }

    #[tokio::test]
    async fn test_wavemeter_channels() {
        let mut meter = SimWavemeter::new("ws8");
        meter
            .open(&params(&[("channels", toml::Value::Integer(4))]))
            .await
            .unwrap();

        let wl = meter.get("ch1_wavelength").await.unwrap();
        assert!(wl.as_f64().unwrap() > 599.0);

        let err = meter.get("ch5_wavelength").await;
        assert!(matches!(err, Err(LabError::Invocation { .. })));

        let err = meter.set("ch2_exposure_ms", ParamValue::Float(5000.0)).await;
        assert!(matches!(err, Err(LabError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_pulsegen_sequence_lifecycle() {
        let mut gen = SimPulseGen::new("ps82");
        gen.open(&ConnectionParams::new()).await.unwrap();

        let err = gen.call("start", &[ParamValue::from("odmr")]).await;
        assert!(matches!(err, Err(LabError::Invocation { .. })));

        let steps = ParamValue::List(vec![ParamValue::Int(100), ParamValue::Int(250)]);
        gen.call("upload", &[ParamValue::from("odmr"), steps])
            .await
            .unwrap();
        gen.call("start", &[ParamValue::from("odmr")]).await.unwrap();
        assert_eq!(gen.get("running").await.unwrap(), ParamValue::Bool(true));

        gen.close().await.unwrap();
        assert!(gen.running.is_none());
    }
}
