//! # Command Dispatcher
//!
//! The dispatcher task is the only owner of the actuator driver. It drains the command channel
//! and turns each command into motor and servo demands, so all actuator access is serialised
//! in the order the commands arrived.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{io, thread::{self, JoinHandle}};
use comms_if::tc::CarCmd;
use log::{debug, info, warn};

use crate::{
    actuator::{ActuatorDriver, ActuatorError, DutyCycle, MotorDemand, MotorId},
    channel::ChanRx
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct CmdDispatcher<D> {
    driver: D,
    cmd_rx: ChanRx<CarCmd>
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<D: ActuatorDriver> CmdDispatcher<D> {
    pub fn new(driver: D, cmd_rx: ChanRx<CarCmd>) -> Self {
        Self { driver, cmd_rx }
    }

    /// Run the dispatch loop until the command channel disconnects.
    ///
    /// Actuator errors are logged and the loop carries on with the next command.
    pub fn run(mut self) -> D {
        info!("Command dispatcher started");

        while let Ok(cmd) = self.cmd_rx.pop() {
            debug!("Dispatching {:?}", cmd);

            if let Err(e) = self.apply(&cmd) {
                warn!("Could not apply {:?}: {}", cmd, e);
            }
        }

        info!("Command channel disconnected, dispatcher stopping");
        self.driver
    }

    /// Apply a single command to the actuators.
    pub fn apply(&mut self, cmd: &CarCmd) -> Result<(), ActuatorError> {
        match *cmd {
            CarCmd::Advance { duty_pct } => self.set_all(MotorDemand::Advance(DutyCycle::clamped(duty_pct))),
            CarCmd::Retreat { duty_pct } => self.set_all(MotorDemand::Retreat(DutyCycle::clamped(duty_pct))),
            CarCmd::Brake => self.set_all(MotorDemand::Brake),
            // Pivot on the spot, the outer side drives forwards and the inner side backwards
            CarCmd::TurnLeft { duty_pct } => self.pivot(&MotorId::RIGHT, &MotorId::LEFT, duty_pct),
            CarCmd::TurnRight { duty_pct } => self.pivot(&MotorId::LEFT, &MotorId::RIGHT, duty_pct),
            // The mount's servos are installed so that their positive direction is opposite to
            // the operator's
            CarCmd::PanTilt { axis, angle_deg } => self.driver.set_servo(axis, angle_deg.saturating_neg())
        }
    }

    fn set_all(&mut self, demand: MotorDemand) -> Result<(), ActuatorError> {
        for m in MotorId::ALL.iter() {
            self.driver.set_motor(*m, demand)?;
        }
        Ok(())
    }

    fn pivot(&mut self, outer: &[MotorId], inner: &[MotorId], duty_pct: u8) -> Result<(), ActuatorError> {
        let duty = DutyCycle::clamped(duty_pct);

        for m in outer {
            self.driver.set_motor(*m, MotorDemand::Advance(duty))?;
        }
        for m in inner {
            self.driver.set_motor(*m, MotorDemand::Retreat(duty))?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Spawn the command dispatcher task.
pub fn spawn<D>(driver: D, cmd_rx: ChanRx<CarCmd>) -> io::Result<JoinHandle<D>>
where
    D: ActuatorDriver + 'static
{
    thread::Builder::new()
        .name("cmd_dispatch".into())
        .spawn(move || CmdDispatcher::new(driver, cmd_rx).run())
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::tc::ServoAxis;
    use crate::channel;

    /// Records every demand it is given.
    #[derive(Default)]
    struct Recorder {
        motors: Vec<(MotorId, MotorDemand)>,
        servos: Vec<(ServoAxis, i8)>
    }

    impl ActuatorDriver for Recorder {
        fn set_motor(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError> {
            self.motors.push((motor, demand));
            Ok(())
        }

        fn set_servo(&mut self, axis: ServoAxis, angle_deg: i8) -> Result<(), ActuatorError> {
            self.servos.push((axis, angle_deg));
            Ok(())
        }
    }

    fn dispatcher() -> CmdDispatcher<Recorder> {
        let (_tx, rx) = channel::bounded("cmd", 2).unwrap();
        CmdDispatcher::new(Recorder::default(), rx)
    }

    fn demand_of(rec: &Recorder, motor: MotorId) -> Option<MotorDemand> {
        rec.motors.iter().rev().find(|(m, _)| *m == motor).map(|(_, d)| *d)
    }

    #[test]
    fn test_drive_all() {
        let mut d = dispatcher();

        d.apply(&CarCmd::Retreat { duty_pct: 70 }).unwrap();
        assert_eq!(d.driver.motors.len(), 4);
        for m in MotorId::ALL.iter() {
            assert_eq!(demand_of(&d.driver, *m), Some(MotorDemand::Retreat(DutyCycle::clamped(70))));
        }

        d.apply(&CarCmd::Brake).unwrap();
        for m in MotorId::ALL.iter() {
            assert_eq!(demand_of(&d.driver, *m), Some(MotorDemand::Brake));
        }
    }

    #[test]
    fn test_pivot() {
        let mut d = dispatcher();
        let duty = DutyCycle::clamped(40);

        d.apply(&CarCmd::TurnLeft { duty_pct: 40 }).unwrap();
        assert_eq!(demand_of(&d.driver, MotorId::FrontRight), Some(MotorDemand::Advance(duty)));
        assert_eq!(demand_of(&d.driver, MotorId::RearRight), Some(MotorDemand::Advance(duty)));
        assert_eq!(demand_of(&d.driver, MotorId::FrontLeft), Some(MotorDemand::Retreat(duty)));
        assert_eq!(demand_of(&d.driver, MotorId::RearLeft), Some(MotorDemand::Retreat(duty)));

        d.apply(&CarCmd::TurnRight { duty_pct: 40 }).unwrap();
        assert_eq!(demand_of(&d.driver, MotorId::FrontLeft), Some(MotorDemand::Advance(duty)));
        assert_eq!(demand_of(&d.driver, MotorId::RearRight), Some(MotorDemand::Retreat(duty)));
    }

    #[test]
    fn test_pan_tilt_inverted() {
        let mut d = dispatcher();

        d.apply(&CarCmd::PanTilt { axis: ServoAxis::Pan, angle_deg: 30 }).unwrap();
        d.apply(&CarCmd::PanTilt { axis: ServoAxis::Tilt, angle_deg: -90 }).unwrap();

        assert_eq!(d.driver.servos, vec![(ServoAxis::Pan, -30), (ServoAxis::Tilt, 90)]);
        assert!(d.driver.motors.is_empty());
    }

    #[test]
    fn test_run_in_order() {
        let (tx, rx) = channel::bounded("cmd", 2).unwrap();
        let jh = spawn(Recorder::default(), rx).unwrap();

        tx.push(CarCmd::Advance { duty_pct: 50 }).unwrap();
        tx.push(CarCmd::Brake).unwrap();
        drop(tx);

        let rec = jh.join().unwrap();
        let fl: Vec<_> = rec.motors.iter()
            .filter(|(m, _)| *m == MotorId::FrontLeft)
            .map(|(_, d)| *d)
            .collect();
        assert_eq!(fl, vec![MotorDemand::Advance(DutyCycle::clamped(50)), MotorDemand::Brake]);
    }
}
