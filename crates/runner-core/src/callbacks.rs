//! The post-run result callback.
//!
//! After a forward model exits cleanly, [`forward_model_ok`] reads the
//! realization's outputs from its runpath and persists them to ensemble
//! storage. The callback never touches scheduler state; its verdict is
//! returned as a [`LoadResult`] and mirrored into the ensemble state map.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::config::{ParameterConfig, ResponseConfig};
use crate::load::{LoadResult, LoadStatus};
use crate::run_arg::RunArg;
use crate::storage::RealizationState;

fn read_parameters(run_arg: &RunArg, configs: &[Arc<dyn ParameterConfig>]) -> LoadResult {
    let mut result = LoadResult::success();
    let mut error_msg = String::new();
    for config in configs {
        if !config.forward_init() {
            continue;
        }
        info!(parameter = config.name(), "starting to load parameter");
        let start = Instant::now();
        let loaded = config
            .read_from_runpath(&run_arg.runpath, run_arg.iens)
            .map_err(|err| err.to_string())
            .and_then(|dataset| {
                info!(parameter = config.name(), elapsed = ?start.elapsed(), "loaded parameter");
                let start = Instant::now();
                run_arg
                    .ensemble
                    .save_parameters(config.name(), run_arg.iens, dataset)
                    .map_err(|err| err.to_string())
                    .inspect(|_| {
                        info!(
                            parameter = config.name(),
                            elapsed = ?start.elapsed(),
                            "saved parameter to storage"
                        );
                    })
            });
        if let Err(message) = loaded {
            error_msg.push_str(&message);
            result = LoadResult::failure(error_msg.clone());
        }
    }
    result
}

fn write_responses_to_storage(run_arg: &RunArg, configs: &[Arc<dyn ResponseConfig>]) -> LoadResult {
    let mut errors: Vec<String> = Vec::new();
    for config in configs {
        // Summary configurations without keys have nothing to load.
        if matches!(config.summary_keys(), Some(keys) if keys.is_empty()) {
            continue;
        }
        info!(response = config.name(), "starting to load response");
        let start = Instant::now();
        let loaded = config
            .read_from_file(&run_arg.runpath, run_arg.iens)
            .map_err(|err| err.to_string())
            .and_then(|dataset| {
                info!(response = config.name(), elapsed = ?start.elapsed(), "loaded response");
                let start = Instant::now();
                run_arg
                    .ensemble
                    .save_response(config.name(), dataset, run_arg.iens)
                    .map_err(|err| err.to_string())
                    .inspect(|_| {
                        info!(
                            response = config.name(),
                            elapsed = ?start.elapsed(),
                            "saved response to storage"
                        );
                    })
            });
        if let Err(message) = loaded {
            errors.push(message);
        }
    }
    if errors.is_empty() {
        LoadResult::success()
    } else {
        LoadResult::failure(errors.join("\n"))
    }
}

/// Read a realization's outputs from its runpath into ensemble storage.
///
/// Forward-initialized parameters are only read on iteration 0; after the
/// prior they are produced by the update step, not the forward model. A
/// parameter failure short-circuits response loading. The ensemble state map
/// entry for the realization ends up as `HasData` or `LoadFailure`.
pub fn forward_model_ok(run_arg: &RunArg) -> LoadResult {
    let experiment = run_arg.ensemble.experiment();

    let parameters_result = if run_arg.itr == 0 {
        read_parameters(run_arg, experiment.parameter_configuration())
    } else {
        LoadResult::success()
    };

    let response_result = if parameters_result.is_success() {
        write_responses_to_storage(run_arg, experiment.response_configuration())
    } else {
        LoadResult::success()
    };

    let final_result = if !response_result.is_success() {
        response_result
    } else {
        parameters_result
    };

    if !final_result.is_success() {
        error!(
            iens = run_arg.iens,
            message = %final_result.message,
            "failed to load results for realization"
        );
    }

    run_arg.ensemble.set_state(
        run_arg.iens,
        if final_result.status == LoadStatus::LoadSuccessful {
            RealizationState::HasData
        } else {
            RealizationState::LoadFailure
        },
    );

    final_result
}
