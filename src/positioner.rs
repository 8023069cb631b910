//! Per-positioner state.
//!
//! A `Positioner` is pure bookkeeping: status bits, firmware, angles and the
//! lifecycle flags. Operations that talk to the hardware live on `Fps`,
//! which passes the dispatcher capability explicitly.

use semver::Version;

use crate::maskbits::PositionerStatus;

/// The firmware encodes bootloader mode in the minor version field.
pub const BOOTLOADER_MINOR: u64 = 80;

pub fn is_bootloader_version(version: &Version) -> bool {
    version.minor == BOOTLOADER_MINOR
}

/// Normalises an angle to `[0, 360)` degrees.
pub fn normalise_angle(degrees: f64) -> f64 {
    degrees.rem_euclid(360.0)
}

#[derive(Debug, Clone)]
pub struct Positioner {
    pub id: u16,
    pub firmware: Option<Version>,
    pub status: PositionerStatus,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub disabled: bool,
    /// Physically present but not answering; implies `disabled`.
    pub offline: bool,
    pub initialised: bool,
    pub precise_moves: bool,
    pub interface: Option<usize>,
    pub bus: Option<usize>,
}

impl Positioner {
    pub fn new(id: u16) -> Positioner {
        Positioner {
            id,
            firmware: None,
            status: PositionerStatus::empty(),
            alpha: None,
            beta: None,
            disabled: false,
            offline: false,
            initialised: false,
            precise_moves: true,
            interface: None,
            bus: None,
        }
    }

    /// An offline positioner with operator-supplied angles.
    pub fn offline_at(id: u16, alpha: f64, beta: f64) -> Positioner {
        let mut positioner = Positioner::new(id);
        positioner.disabled = true;
        positioner.offline = true;
        positioner.alpha = Some(normalise_angle(alpha));
        positioner.beta = Some(normalise_angle(beta));
        positioner
    }

    pub fn update_status(&mut self, raw: u32) {
        self.status = PositionerStatus::from_bits_truncate(raw);
    }

    pub fn update_position(&mut self, alpha: f64, beta: f64) {
        self.alpha = Some(normalise_angle(alpha));
        self.beta = Some(normalise_angle(beta));
    }

    pub fn collision(&self) -> bool {
        self.status.collided()
    }

    pub fn moving(&self) -> bool {
        self.initialised && !self.status.contains(PositionerStatus::DISPLACEMENT_COMPLETED)
    }

    pub fn is_bootloader(&self) -> bool {
        self.firmware.as_ref().map(is_bootloader_version).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_implies_disabled() {
        let positioner = Positioner::offline_at(9, 370.0, -10.0);
        assert!(positioner.disabled);
        assert!(positioner.offline);
        assert_eq!(positioner.alpha, Some(10.0));
        assert_eq!(positioner.beta, Some(350.0));
    }

    #[test]
    fn test_collision_and_moving_derivation() {
        let mut positioner = Positioner::new(4);
        positioner.initialised = true;

        positioner.update_status(
            (PositionerStatus::SYSTEM_INITIALIZED | PositionerStatus::COLLISION_BETA).bits(),
        );
        assert!(positioner.collision());
        assert!(positioner.moving());

        positioner.update_status(
            (PositionerStatus::SYSTEM_INITIALIZED | PositionerStatus::DISPLACEMENT_COMPLETED)
                .bits(),
        );
        assert!(!positioner.collision());
        assert!(!positioner.moving());
    }

    #[test]
    fn test_uninitialised_never_moving() {
        let mut positioner = Positioner::new(1);
        positioner.update_status(0);
        assert!(!positioner.moving());
    }

    #[test]
    fn test_bootloader_detection() {
        let mut positioner = Positioner::new(2);
        assert!(!positioner.is_bootloader());
        positioner.firmware = Some(Version::new(4, 80, 3));
        assert!(positioner.is_bootloader());
        positioner.firmware = Some(Version::new(4, 1, 3));
        assert!(!positioner.is_bootloader());
    }
}
