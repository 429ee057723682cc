//! Driver configuration parameters.

use embassy_time::Duration;

/// Layout of the controller flash as seen by the firmware update engine.
///
/// All offsets are byte offsets into the raw firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Total size of a complete firmware image. The write that reaches this
    /// size ends the update and triggers a full panel initialization.
    pub image_size: u32,
    /// Start of the calibration (CX) region that is never overwritten.
    pub calibration_start: u32,
    /// End (exclusive) of the calibration region.
    pub calibration_end: u32,
    /// Maximum payload of one hardware register write.
    pub dma_chunk_size: u32,
    /// Capacity of the device-side flash buffer flushed by one DMA commit.
    pub flash_buffer_size: u32,
}

impl FlashLayout {
    /// Returns `true` if `offset` lies inside the protected calibration region.
    pub const fn is_calibration(&self, offset: u32) -> bool {
        offset >= self.calibration_start && offset < self.calibration_end
    }
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            image_size: 128 * 1024,
            calibration_start: 0x1E000,
            calibration_end: 0x1F000,
            dma_chunk_size: 32,
            flash_buffer_size: 64 * 1024,
        }
    }
}

/// A bounded poll: how many attempts, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up with a timeout.
    pub attempts: u32,
    /// Delay between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Creates a new retry policy.
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Configuration parameters used by [`crate::StTouchpad`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical maximum of the reported X axis. Raw positions are mirrored
    /// against this value.
    pub logical_max_x: u16,
    /// Logical maximum of the reported Y axis.
    pub logical_max_y: u16,
    /// Flash layout used by the firmware update engine.
    pub flash: FlashLayout,
    /// Waiting for the controller-ready event after a reset.
    pub reset_poll: RetryPolicy,
    /// How long the reset line is held low.
    pub reset_pulse: Duration,
    /// Waiting for a host data memory page to be loaded.
    pub host_data_poll: RetryPolicy,
    /// Waiting for the flash ready bit after an erase or a DMA commit.
    pub flash_ready_poll: RetryPolicy,
    /// Waiting for the echo of the full panel initialization command.
    pub full_init_poll: RetryPolicy,
    /// Significant bits per heat-map sample on the wire.
    pub heat_map_bits_per_pixel: u8,
    /// Rescaled heat-map values below this threshold are clamped to zero.
    pub heat_map_threshold: u8,
    /// Error report types that are treated as major faults.
    pub major_error_types: &'static [u8],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logical_max_x: 3207,
            logical_max_y: 1783,
            flash: FlashLayout::default(),
            reset_poll: RetryPolicy::new(100, Duration::from_millis(10)),
            reset_pulse: Duration::from_millis(10),
            host_data_poll: RetryPolicy::new(5, Duration::from_millis(10)),
            flash_ready_poll: RetryPolicy::new(200, Duration::from_millis(50)),
            full_init_poll: RetryPolicy::new(100, Duration::from_millis(100)),
            heat_map_bits_per_pixel: 10,
            heat_map_threshold: 10,
            major_error_types: &[],
        }
    }
}
