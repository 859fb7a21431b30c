use log::debug;
use serde::Serialize;
use std::path::Path;

mod pinning_history;

pub use pinning_history::*;

/// Result types persisted next to a run, encoded as named MessagePack.
pub trait ArtifactExt
where
    Self: Sized + Serialize,
{
    /// WARNING: This doesn't support generic types
    fn name() -> &'static str {
        let full_name = std::any::type_name::<Self>();
        full_name.rsplit("::").next().unwrap_or(full_name)
    }

    fn encode_to_writer<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        let encoded = rmp_serde::to_vec_named(self)?;
        writer.write_all(&encoded)?;
        Ok(())
    }

    fn save_file_to<P: AsRef<Path>>(&self, folder: P, filename: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(folder.as_ref())?;
        let file = std::fs::File::create(folder.as_ref().join(filename))?;
        self.encode_to_writer(file)?;

        debug!("Saved {} to {:?}", Self::name(), folder.as_ref());
        Ok(())
    }

    /// Save as `<pid>.<ArtifactName>.msgpack` inside `folder`.
    fn save_with_pid_to<P: AsRef<Path>>(&self, folder: P, pid: libc::pid_t) -> anyhow::Result<()> {
        self.save_file_to(folder, &format!("{pid}.{}.msgpack", Self::name()))
    }
}
