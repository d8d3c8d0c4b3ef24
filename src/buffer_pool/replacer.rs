use super::frame::{Frame, FrameId};
use crate::errors::Error;
use anyhow::{bail, Result};

/// Second-chance sweep over the frame table.
///
/// The hand advances before each inspection. Invalid frames are taken on the
/// spot; referenced frames lose their refbit and get one more revolution;
/// pinned frames are counted, and once a whole revolution has seen nothing
/// but pinned frames the sweep gives up. Refbit clearing does not feed that
/// counter, so a fully referenced pool still drains within two revolutions.
#[derive(Debug)]
pub(super) struct ClockReplacer {
    hand: FrameId,
    size: usize,
}

impl ClockReplacer {
    pub fn new(size: usize) -> Self {
        // the first advance lands on frame 0
        Self {
            hand: size.saturating_sub(1),
            size,
        }
    }

    fn advance(&mut self) -> FrameId {
        self.hand = (self.hand + 1) % self.size;
        self.hand
    }

    /// Choose the frame to fill next. Write-back of a dirty victim and the
    /// lookup-table removal stay with the caller.
    pub fn pick(&mut self, frames: &mut [Frame]) -> Result<FrameId> {
        let mut pinned = 0;
        while pinned < self.size {
            let id = self.advance();
            let frame = &mut frames[id];

            if !frame.valid() {
                return Ok(id);
            }
            if frame.refbit() {
                frame.set_refbit(false);
                continue;
            }
            if frame.pin_count() > 0 {
                pinned += 1;
                continue;
            }
            return Ok(id);
        }

        bail!(Error::BufferExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n).map(Frame::new).collect()
    }

    #[test]
    fn test_invalid_frames_picked_in_clock_order() -> Result<()> {
        let mut frames = frames(3);
        let mut clock = ClockReplacer::new(3);

        assert_eq!(clock.pick(&mut frames)?, 0);
        assert_eq!(clock.pick(&mut frames)?, 1);
        assert_eq!(clock.pick(&mut frames)?, 2);
        assert_eq!(clock.pick(&mut frames)?, 0);
        Ok(())
    }

    #[test]
    fn test_referenced_frame_gets_second_chance() -> Result<()> {
        let mut frames = frames(2);
        // frame 0 is valid+referenced, frame 1 valid+pinned
        frames[0].force_valid();
        frames[0].set_refbit(true);
        frames[1].force_valid();
        frames[1].pin();

        let mut clock = ClockReplacer::new(2);
        // sweep clears 0's refbit, counts 1 as pinned, then takes 0
        assert_eq!(clock.pick(&mut frames)?, 0);
        assert!(!frames[0].refbit());
        Ok(())
    }

    #[test]
    fn test_all_pinned_fails() {
        let mut frames = frames(2);
        for frame in frames.iter_mut() {
            frame.force_valid();
            frame.set_refbit(true);
            frame.pin();
        }

        let mut clock = ClockReplacer::new(2);
        let err = clock.pick(&mut frames).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::BufferExceeded)
        ));
    }
}
