//! Battery and thermal probes from sysfs. Both are optional hardware; a
//! missing node reads as None, never as an error.

use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub percent: f64,
    pub on_battery: bool,
}

pub fn read_battery(sys_root: &Path) -> Option<BatteryStatus> {
    let bat = sys_root.join("class/power_supply/BAT0");
    let percent: f64 = fs::read_to_string(bat.join("capacity"))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let status = fs::read_to_string(bat.join("status")).ok()?;
    Some(BatteryStatus {
        percent,
        on_battery: status.trim().eq_ignore_ascii_case("discharging"),
    })
}

/// Thermal zone 0 temperature; the kernel reports millidegrees Celsius.
pub fn read_temperature_c(sys_root: &Path) -> Option<f64> {
    let raw: f64 = fs::read_to_string(sys_root.join("class/thermal/thermal_zone0/temp"))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(raw / 1000.0)
}
