use anyhow::{Context, Result};

use crate::{
    cli::UpdateArgs,
    reshuffle::RunSummary,
    update::{self, UpdateOverrides},
};

pub async fn update(args: &UpdateArgs) -> Result<RunSummary> {
    let overrides = UpdateOverrides {
        input_root: args.imgpath.clone(),
        buffer_size: args.imgbuffer,
        end_date: args.end,
        ..UpdateOverrides::default()
    };

    let summary = update::update(&args.ts_path, overrides)
        .await
        .with_context(|| format!("updating {:?}", args.ts_path))?;

    Ok(summary)
}
