use thiserror::Error;

/// The dispatcher could not run the driver at all.
///
/// Anything the driver itself reports, including crashing or hanging, is a
/// [`crate::DispatchOutcome::Failed`] instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unable to start driver '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The driver started but its exit could not be collected.
    #[error("Lost track of driver '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
