pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};
pub use log::{debug, error, info, trace, warn};
