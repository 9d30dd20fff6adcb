// Frame-in-flight bookkeeping
//
// Resources and command buffers never read a shared "current frame" pointer.
// The presentation loop owns a FrameClock and hands the resulting Frame value
// into every call that needs to pick a per-frame slot.

/// Identifies the frame being recorded: which slot it uses and which frame it
/// is overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Slot in `0..max_frames_in_flight`
    pub index: u32,
    /// Monotonic frame count, never wraps in practice
    pub number: u64,
}

impl Frame {
    pub const fn new(index: u32, number: u64) -> Self {
        Self { index, number }
    }

    /// The first frame. Also the frame used for one-off setup work.
    pub const fn first() -> Self {
        Self::new(0, 0)
    }

    pub fn slot(&self) -> usize {
        self.index as usize
    }
}

/// Advances the frame index. Owned by whoever drives presentation; it is the
/// only writer of the frame index.
#[derive(Debug)]
pub struct FrameClock {
    max_frames_in_flight: u32,
    current: Frame,
}

impl FrameClock {
    pub fn new(max_frames_in_flight: u32) -> Self {
        assert!(max_frames_in_flight > 0, "need at least one frame in flight");
        Self {
            max_frames_in_flight,
            current: Frame::first(),
        }
    }

    pub fn current(&self) -> Frame {
        self.current
    }

    pub fn max_frames_in_flight(&self) -> u32 {
        self.max_frames_in_flight
    }

    /// Moves to the next frame and returns it.
    pub fn advance(&mut self) -> Frame {
        self.current = Frame {
            index: (self.current.index + 1) % self.max_frames_in_flight,
            number: self.current.number + 1,
        };
        log::trace!(
            "Frame {} -> slot {}",
            self.current.number,
            self.current.index
        );
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_cycles_through_slots() {
        let mut clock = FrameClock::new(3);
        let mut seen = vec![clock.current().index];
        for _ in 0..5 {
            seen.push(clock.advance().index);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(clock.current().number, 5);
    }

    #[test]
    fn single_frame_clock_stays_on_slot_zero() {
        let mut clock = FrameClock::new(1);
        assert_eq!(clock.advance(), Frame::new(0, 1));
        assert_eq!(clock.advance(), Frame::new(0, 2));
    }
}
