//! Main car-side executable entry point.
//!
//! # Architecture
//!
//! The car runs a set of long lived tasks connected by bounded channels:
//!
//!     - Frame pipeline: camera -> frame channel
//!     - Telemetry sampler: telemetry source -> telemetry channel, only while a telemetry
//!       session is active
//!     - Command dispatcher: command channel -> actuators
//!     - Stream and telemetry session tasks: frame/telemetry channel -> attached connection
//!     - Server reactor (main thread): accepts connections, feeds control messages into the
//!       command channel and hands session connections to the worker pool

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{path::PathBuf, thread::JoinHandle, time::Duration};
use color_eyre::{Result, eyre::{WrapErr, eyre}};
use log::info;
use structopt::StructOpt;

use car_lib::{
    actuator::{ActuatorDriver, sim::{SimActuator, SimRig}},
    channel::{self, ChanTx},
    cmd_dispatch,
    cmd_ingress::CmdIngress,
    frame::{Frame, FramePool, sim::SimCamera},
    frame_pipeline,
    params::{ActuatorBackend, ActuatorParams, CameraBackend, CameraParams, CarExecParams, TelemetryBackend},
    server::CarServer,
    session::{self, StreamSession, TelemetrySession},
    tm::{PulseOdometer, host::HostTelemetry, sampler::{self, SamplerCtrl}, sim::SimTelemetry},
    worker_pool::WorkerPool
};
use util::{
    logger::{logger_init, LevelFilter},
    session::Session
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "car_exec", about = "Onboard controller of the robot car")]
struct Args {
    /// Parameter file to use instead of $CAR_SW_ROOT/params/car_exec.toml
    #[structopt(short, long, parse(from_os_str))]
    params: Option<PathBuf>,

    /// Only log to stdout, without creating a session directory
    #[structopt(long)]
    no_session: bool,

    /// Log trace messages
    #[structopt(short, long)]
    verbose: bool
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    let args = Args::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = match args.no_session {
        true => None,
        false => Some(Session::new(
            "car_exec",
            "sessions"
        ).wrap_err("Failed to create the session")?)
    };

    // Initialise logger
    let level = match args.verbose {
        true => LevelFilter::Trace,
        false => LevelFilter::Debug
    };
    logger_init(level, session.as_ref())
        .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Car Executable\n");
    if let Some(ref s) = session {
        info!("Session directory: {:?}\n", s.session_root);
    }

    // ---- LOAD PARAMETERS ----

    let params: CarExecParams = match args.params {
        Some(ref path) => util::params::load_from(path),
        None => util::params::load("car_exec.toml")
    }.wrap_err("Could not load car_exec params")?;

    info!("Exec parameters loaded");

    // ---- CHANNELS ----

    let (cmd_tx, cmd_rx) = channel::bounded("cmd", params.channels.command_depth)
        .wrap_err("Could not create the command channel")?;
    let (frame_tx, frame_rx) = channel::bounded("frame", params.channels.frame_depth)
        .wrap_err("Could not create the frame channel")?;
    let (tm_tx, tm_rx) = channel::bounded("tm", params.channels.telemetry_depth)
        .wrap_err("Could not create the telemetry channel")?;

    // ---- TASKS ----

    // Shared by the simulated actuators and the simulated telemetry
    let rig = SimRig::new();

    let driver: Box<dyn ActuatorDriver> = match params.actuators.backend {
        ActuatorBackend::Sim => Box::new(SimActuator::new(rig.clone())),
        ActuatorBackend::Pca9685 => open_pca9685(&params.actuators)?
    };
    cmd_dispatch::spawn(driver, cmd_rx)
        .wrap_err("Could not spawn the command dispatcher")?;
    info!("Command dispatcher started ({:?} actuators)", params.actuators.backend);

    spawn_camera(&params.camera, frame_tx)?;
    info!("Frame pipeline started ({:?} camera)", params.camera.backend);

    let tm = &params.telemetry;
    let sampler_ctrl = SamplerCtrl::new();
    let period = Duration::from_millis(tm.period_ms);
    match tm.backend {
        TelemetryBackend::Sim => sampler::spawn(
            SimTelemetry::new(
                rig,
                tm.sensors,
                PulseOdometer::new(tm.encoder_slots, tm.wheel_diameter_m)
            ),
            sampler_ctrl.clone(),
            tm_tx,
            period
        ),
        TelemetryBackend::Host => sampler::spawn(
            HostTelemetry::new(&tm.iface, tm.sensors),
            sampler_ctrl.clone(),
            tm_tx,
            period
        )
    }.wrap_err("Could not spawn the telemetry sampler")?;
    info!("Telemetry sampler started ({:?} source)", tm.backend);

    let poll = Duration::from_millis(params.session.poll_ms);
    let (stream_handoff, _, _) = session::spawn(StreamSession, frame_rx, poll)
        .wrap_err("Could not start the stream session task")?;
    let (tm_handoff, _, _) = session::spawn(TelemetrySession::new(sampler_ctrl), tm_rx, poll)
        .wrap_err("Could not start the telemetry session task")?;

    let pool = WorkerPool::new(
        params.workers.count,
        Duration::from_millis(params.workers.ready_timeout_ms)
    ).wrap_err("Could not start the worker pool")?;

    // ---- SERVER ----

    let mut server = CarServer::new(
        params.server_config(),
        CmdIngress::new(cmd_tx),
        pool,
        stream_handoff,
        tm_handoff
    ).wrap_err("Could not start the car server")?;

    info!("Initialisation complete\n");

    server.run();

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn spawn_camera(params: &CameraParams, frame_tx: ChanTx<Frame>) -> Result<JoinHandle<()>> {
    let pool = FramePool::new(
        params.num_buffers,
        (params.width * params.height) as usize / 2
    ).wrap_err("Could not create the frame pool")?;
    let acquire_timeout = Duration::from_millis(params.acquire_timeout_ms);

    let (width, height, quality, fps) =
        (params.width, params.height, params.jpeg_quality, params.frame_rate);

    match params.backend {
        CameraBackend::Sim => frame_pipeline::spawn(
            move || Ok(SimCamera::new(width, height, quality, fps)),
            pool,
            acquire_timeout,
            frame_tx
        ).wrap_err("Could not spawn the frame pipeline"),
        CameraBackend::V4l => spawn_v4l(params, pool, acquire_timeout, frame_tx)
    }
}

#[cfg(feature = "v4l")]
fn spawn_v4l(
    params: &CameraParams,
    pool: FramePool,
    acquire_timeout: Duration,
    frame_tx: ChanTx<Frame>
) -> Result<JoinHandle<()>> {
    use car_lib::frame::v4l::V4lCamera;

    let device = params.device.clone();
    let (width, height, fps) = (params.width, params.height, params.frame_rate);

    frame_pipeline::spawn(
        move || V4lCamera::new(&device, width, height, fps),
        pool,
        acquire_timeout,
        frame_tx
    ).wrap_err("Could not spawn the frame pipeline")
}

#[cfg(not(feature = "v4l"))]
fn spawn_v4l(
    _params: &CameraParams,
    _pool: FramePool,
    _acquire_timeout: Duration,
    _frame_tx: ChanTx<Frame>
) -> Result<JoinHandle<()>> {
    Err(eyre!("The v4l camera backend needs car_exec to be built with the \"v4l\" feature"))
}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
fn open_pca9685(params: &ActuatorParams) -> Result<Box<dyn ActuatorDriver>> {
    use car_lib::actuator::pca9685::Pca9685Actuator;

    let driver = Pca9685Actuator::open_rpi(params.i2c_bus, params.address, params.channels.clone())
        .wrap_err("Could not open the PCA9685 board")?;

    Ok(Box::new(driver))
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
fn open_pca9685(_params: &ActuatorParams) -> Result<Box<dyn ActuatorDriver>> {
    Err(eyre!("The PCA9685 actuators are only available on the Raspberry Pi"))
}
