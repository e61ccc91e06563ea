use std::path::Path;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::image::ConfigSchema;

/// One way of turning an image identifier into a local filesystem.
pub trait Source: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Whether this source can handle `identifier`. Must not change any state
    /// visible to other sources.
    fn supports_image(&self, identifier: &str) -> bool;

    /// Writes the merged image filesystem into `dest`, which the caller owns.
    fn materialize_filesystem(
        &self,
        identifier: &str,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<()>;

    /// Reads the environment and build history declared by the image.
    fn extract_config(&self, identifier: &str) -> Result<ConfigSchema>;
}
