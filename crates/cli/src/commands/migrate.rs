use procure_db::{connect_with_config, migrations};
use tracing::info;

use crate::commands::{current_thread_runtime, load_config, CommandResult};

const COMMAND: &str = "migrate";

pub fn run() -> CommandResult {
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match current_thread_runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => {
            info!(
                event_name = "system.migrations.applied",
                known_migrations = migrations::known_migrations(),
                "schema migrations applied"
            );
            CommandResult::success(
                COMMAND,
                format!("applied pending migrations ({} known)", migrations::known_migrations()),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}
