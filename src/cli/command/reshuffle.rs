use anyhow::{anyhow, Context, Result};

use crate::{
    cli::ReshuffleArgs,
    grid::BoundingBox,
    reshuffle::{self, ReshuffleOptions, RunSummary},
};

pub async fn reshuffle(args: &ReshuffleArgs) -> Result<RunSummary> {
    let options = options(args)?;

    let summary = reshuffle::reshuffle(
        &args.img_path,
        &args.ts_path,
        args.start,
        args.end,
        args.variables.clone(),
        options,
    )
    .await
    .with_context(|| format!("reshuffling {:?} into {:?}", args.img_path, args.ts_path))?;

    Ok(summary)
}

fn options(args: &ReshuffleArgs) -> Result<ReshuffleOptions> {
    let bbox = match args.bbox.as_deref() {
        None => None,
        Some(&[min_lon, min_lat, max_lon, max_lat]) => Some(BoundingBox::new(min_lon, min_lat, max_lon, max_lat)?),
        Some(values) => return Err(anyhow!("--bbox takes 4 values, got {}", values.len())),
    };

    Ok(ReshuffleOptions {
        h_steps: args.h_steps.clone(),
        bbox,
        land_points: args.land_points,
        buffer_size: args.imgbuffer,
        cell_size: args.cell_size,
    })
}

// -- Tests -------------------------------------------------------------------
