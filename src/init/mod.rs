// SPDX-License-Identifier: Apache-2.0

//! Configuration and wiring: CLI args and tailer construction.

pub mod args;

use std::sync::Arc;

use crate::tailer::glob::globs_from_patterns;
use crate::tailer::{
    run_file_tailer, run_polling_tailer, run_stdin_tailer, FilePositionStore, PollConfig,
    PositionStore, Tail, TailError, WatchConfig, WebhookHandler, WebhookTailer,
};
use args::{Args, FileMode, InputType};

/// Everything the binary needs from the selected input variant.
pub struct TailerSetup {
    pub tailer: Box<dyn Tail>,
    /// Handler to mount on the HTTP server when input is webhook.
    pub webhook: Option<(String, WebhookHandler)>,
    /// Present for file input; must be stopped after the tailer is closed.
    pub position_store: Option<Arc<dyn PositionStore>>,
}

/// Build the tailer selected by the configuration.
pub fn start_tailer(args: &Args) -> Result<TailerSetup, TailError> {
    match args.input_type {
        InputType::File => {
            let include = globs_from_patterns(&args.input_include)?;
            let exclude = globs_from_patterns(&args.input_exclude)?;

            let store: Arc<dyn PositionStore> = Arc::new(FilePositionStore::open(
                &args.position_file,
                args.position_sync_interval(),
            )?);

            let tailer: Box<dyn Tail> = match args.file_mode {
                FileMode::Poll => Box::new(run_polling_tailer(
                    PollConfig {
                        include,
                        exclude,
                        poll_interval: args.poll_interval(),
                        fail_on_missing_file: args.fail_on_missing_file,
                    },
                    store.clone(),
                )?),
                // `watch` and `mixed` share one implementation: discovery is
                // event-driven while every reader follows its file by
                // polling, which is what covers late-appearing symlink
                // targets.
                FileMode::Watch | FileMode::Mixed => Box::new(run_file_tailer(
                    WatchConfig {
                        include,
                        exclude,
                        follow_interval: args.poll_interval(),
                        idle_timeout: args.idle_timeout(),
                        fail_on_missing_file: args.fail_on_missing_file,
                    },
                    store.clone(),
                )?),
            };

            Ok(TailerSetup {
                tailer,
                webhook: None,
                position_store: Some(store),
            })
        }
        InputType::Stdin => Ok(TailerSetup {
            tailer: Box::new(run_stdin_tailer()),
            webhook: None,
            position_store: None,
        }),
        InputType::Webhook => {
            let tailer = WebhookTailer::new(&args.webhook_path, args.webhook_format.into());
            let handler = tailer.handler();
            Ok(TailerSetup {
                tailer: Box::new(tailer),
                webhook: Some((args.webhook_path.clone(), handler)),
                position_store: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn builds_file_tailer_with_position_store() {
        let dir = TempDir::new().unwrap();
        let include = format!("{}/*.log", dir.path().display());
        let position = dir.path().join("position.json");

        let args = Args::parse_from([
            "tailmet",
            "--input-include",
            &include,
            "--position-file",
            position.to_str().unwrap(),
        ]);

        let mut setup = start_tailer(&args).unwrap();
        assert!(setup.position_store.is_some());
        assert!(setup.webhook.is_none());

        setup.tailer.close();
        setup.position_store.unwrap().stop();
    }

    #[test]
    fn builds_webhook_tailer_with_handler() {
        let args = Args::parse_from(["tailmet", "--input-type", "webhook"]);
        let mut setup = start_tailer(&args).unwrap();
        assert!(setup.webhook.is_some());
        assert!(setup.position_store.is_none());
        setup.tailer.close();
    }

    #[test]
    fn corrupt_position_file_fails_startup() {
        let dir = TempDir::new().unwrap();
        let include = format!("{}/*.log", dir.path().display());
        let position = dir.path().join("position.json");
        std::fs::write(&position, b"{{{{").unwrap();

        let args = Args::parse_from([
            "tailmet",
            "--input-include",
            &include,
            "--position-file",
            position.to_str().unwrap(),
        ]);

        let err = start_tailer(&args).err().unwrap();
        assert!(err.to_string().contains("position"));
    }
}
