// alexa-core: session and device-control engine for the Alexa REST bridge.
//
// The engine drives an authenticated browser session against the Amazon web
// front end and exposes device discovery and playback control on top of it.

pub mod directory;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod executor;
pub mod session;

pub use directory::{DeviceCache, DeviceDescriptor, Directory, slugify};
pub use dispatcher::Dispatcher;
pub use driver::{CdpDriver, DriverOptions, PageDriver, PageLoad, Viewport};
pub use error::{Error, Result};
pub use executor::{RemoteCallExecutor, RemoteResponse, RequestBody};
pub use session::{Credentials, SessionMachine, SessionState};
