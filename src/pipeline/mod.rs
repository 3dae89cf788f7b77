pub mod channel;
pub mod gate;
pub mod orchestrator;
pub mod probe;
pub mod shm;
pub mod shutdown;
pub mod switcher;

pub use channel::{Channel, ChannelStats, DetectionChannel, FrameChannel, Published, Record};
pub use orchestrator::{Pipeline, PipelineHandle, ShutdownReport};
pub use probe::BrightnessProbe;
pub use switcher::{
    BrightnessStat, BrightnessZone, CameraStatus, CameraSwitchController, ControlMode,
    SwitchCommand, Transition,
};
