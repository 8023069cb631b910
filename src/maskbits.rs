//! Bit-flag words shared with the positioner firmware.

use bitflags::bitflags;

bitflags! {
    /// Status word reported by a positioner in reply to `GET_STATUS`.
    ///
    /// The bit assignments are fixed by the firmware and must not be
    /// renumbered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PositionerStatus: u32 {
        const SYSTEM_INITIALIZED             = 0x0000_0001;
        const CONFIG_CHANGED                 = 0x0000_0002;
        const RECEIVING_TRAJECTORY           = 0x0000_0004;
        const TRAJECTORY_ALPHA_RECEIVED      = 0x0000_0008;
        const TRAJECTORY_BETA_RECEIVED       = 0x0000_0010;
        const DISPLACEMENT_COMPLETED         = 0x0000_0020;
        const DISPLACEMENT_COMPLETED_ALPHA   = 0x0000_0040;
        const DISPLACEMENT_COMPLETED_BETA    = 0x0000_0080;
        const COLLISION_ALPHA                = 0x0000_0100;
        const COLLISION_BETA                 = 0x0000_0200;
        const CLOSED_LOOP_ALPHA              = 0x0000_0400;
        const CLOSED_LOOP_BETA               = 0x0000_0800;
        const PRECISE_POSITIONING_ALPHA      = 0x0000_1000;
        const PRECISE_POSITIONING_BETA       = 0x0000_2000;
        const COLLISION_DETECT_ALPHA_DISABLE = 0x0000_4000;
        const COLLISION_DETECT_BETA_DISABLE  = 0x0000_8000;
        const MOTOR_CALIBRATED_ALPHA         = 0x0001_0000;
        const MOTOR_CALIBRATED_BETA          = 0x0002_0000;
        const DATUM_INITIALIZED_ALPHA        = 0x0004_0000;
        const DATUM_INITIALIZED_BETA         = 0x0008_0000;
        const LOW_POWER_AFTER_MOVE           = 0x0010_0000;
    }
}

impl PositionerStatus {
    pub const COLLISION: PositionerStatus = PositionerStatus::COLLISION_ALPHA
        .union(PositionerStatus::COLLISION_BETA);

    /// `true` if either axis reports a collision.
    pub fn collided(self) -> bool {
        self.intersects(Self::COLLISION)
    }

    /// Human-readable list of active bit names.
    pub fn active_bits(self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        names.join("|")
    }
}

bitflags! {
    /// Aggregate fleet status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FPSStatus: u16 {
        const IDLE                  = 0x0001;
        const MOVING                = 0x0002;
        const COLLIDED              = 0x0004;
        const TEMPERATURE_NORMAL    = 0x0010;
        const TEMPERATURE_COLD      = 0x0020;
        const TEMPERATURE_VERY_COLD = 0x0040;
    }
}

impl FPSStatus {
    pub const STATUS_BITS: FPSStatus = FPSStatus::IDLE
        .union(FPSStatus::MOVING)
        .union(FPSStatus::COLLIDED);

    pub const TEMPERATURE_BITS: FPSStatus = FPSStatus::TEMPERATURE_NORMAL
        .union(FPSStatus::TEMPERATURE_COLD)
        .union(FPSStatus::TEMPERATURE_VERY_COLD);

    /// Replaces the motion bits, keeping temperature and any other bits.
    pub fn with_motion(self, motion: FPSStatus) -> FPSStatus {
        (self & !Self::STATUS_BITS) | motion
    }
}

impl Default for FPSStatus {
    fn default() -> Self {
        FPSStatus::IDLE | FPSStatus::TEMPERATURE_NORMAL
    }
}
