use log::debug;
use serde::Serialize;

mod process_tree;

pub use process_tree::*;

pub trait ArtifactExt
where
    Self: Sized + Serialize,
{
    /// File extension used when the artifact is persisted.
    const EXTENSION: &'static str = "json";

    /// WARNING: This doesn't support generic types
    fn name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("artifact")
    }

    /// Encode as two-space indented JSON, the format served back to readers verbatim.
    fn encode_to_writer<W: std::io::Write>(&self, writer: W) -> anyhow::Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn encode_pretty(&self) -> anyhow::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.encode_to_writer(&mut buffer)?;
        debug!("Encoded {} ({} bytes)", Self::name(), buffer.len());
        Ok(buffer)
    }

    fn file_name(stem: &str) -> String {
        format!("{stem}.{}", Self::EXTENSION)
    }
}
