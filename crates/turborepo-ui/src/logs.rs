use std::io::Write;

use turbopath::AbsoluteSystemPath;

use crate::Error;

/// Replays a captured log file through the given writer. Used on cache
/// hits to reproduce the original task output without running anything.
pub fn replay_logs<W: Write>(
    mut output: W,
    log_file_name: &AbsoluteSystemPath,
) -> Result<(), Error> {
    let log_file_bytes = log_file_name.read().map_err(Error::CannotReadLogs)?;
    output
        .write_all(&log_file_bytes)
        .map_err(Error::CannotWriteLogs)?;
    output.flush().map_err(Error::CannotWriteLogs)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_replay_writes_bytes_verbatim() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let log_file = root.join_component("turbo-build.log");
        log_file.create_with_contents("line one\nline two\n")?;

        let mut replayed = Vec::new();
        replay_logs(&mut replayed, &log_file)?;
        assert_eq!(String::from_utf8(replayed)?, "line one\nline two\n");
        Ok(())
    }

    #[test]
    fn test_replay_missing_file_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let missing = root.join_component("nope.log");

        let mut replayed = Vec::new();
        assert!(replay_logs(&mut replayed, &missing).is_err());
        Ok(())
    }
}
