//! External peripheral-model hook.
//!
//! Collaborators that extend the simulated system (a display, a sensor, a
//! scripted test fixture) implement [`Model`]. The driver calls
//! [`Model::config`] once after the firmware is loaded and
//! [`Model::tick`] after every cycle, handing out mutable access to the
//! machine between cycles. Anything a model writes into data memory is a
//! bus-master write: the next cycle sees it.
//!
//! The access surface a model needs is plain [`Mcu`] API:
//! [`Mcu::read_reg`]/[`Mcu::write_reg`] for bytes,
//! [`Mcu::read_io_bit`]/[`Mcu::write_io_bit`] for bits,
//! [`Mcu::freq`] and [`Mcu::set_run_state`] for simulation control.

use crate::Mcu;

/// Hook implemented by external peripheral models.
pub trait Model {
    /// Called once when the simulated MCU has been configured.
    fn config(&mut self, _mcu: &mut Mcu) {}

    /// Called after every simulated cycle.
    fn tick(&mut self, mcu: &mut Mcu);
}

/// Run the per-cycle hook of every registered model.
pub fn tick_models(mcu: &mut Mcu, models: &mut [Box<dyn Model>]) {
    for m in models.iter_mut() {
        m.tick(mcu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::RunState;

    /// Toy model: stops the simulation once PORTB bit 0 goes high.
    struct StopOnPortB0 {
        fired: bool,
    }

    impl Model for StopOnPortB0 {
        fn config(&mut self, mcu: &mut Mcu) {
            mcu.write_io_bit(0x24, 0, true); // DDRB0 as output
        }

        fn tick(&mut self, mcu: &mut Mcu) {
            if mcu.read_io_bit(0x25, 0) && !self.fired {
                self.fired = true;
                mcu.set_run_state(RunState::Stop);
            }
        }
    }

    #[test]
    fn test_model_observes_and_controls() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        let mut models: Vec<Box<dyn Model>> = vec![Box::new(StopOnPortB0 { fired: false })];
        for m in models.iter_mut() {
            m.config(&mut mcu);
        }
        assert!(mcu.read_io_bit(0x24, 0));

        tick_models(&mut mcu, &mut models);
        assert_eq!(mcu.run_state, RunState::Running);

        mcu.write_io_bit(0x25, 0, true);
        tick_models(&mut mcu, &mut models);
        assert_eq!(mcu.run_state, RunState::Stop);
    }
}
