// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The evaluator's out-of-band log frames.
//!
//! Log frames arrive interleaved with responses and are never part of the
//! request/response pairing; they are emitted onto the host's `tracing`
//! subscriber under the `pkl` target as soon as they are pulled off the
//! wire.

use libpkl_ipc::message::Log;
use tracing::{trace, warn};

const LEVEL_TRACE: i64 = 0;
const LEVEL_WARN: i64 = 1;

pub(crate) fn emit(log: &Log) {
    let rendered = render(log);
    match log.level {
        LEVEL_TRACE => trace!(target: "pkl", "{rendered}"),
        LEVEL_WARN => warn!(target: "pkl", "{rendered}"),
        other => warn!(target: "pkl", "unknown log level {other}: {rendered}"),
    }
}

fn render(log: &Log) -> String {
    let level = if log.level == LEVEL_WARN { "WARN" } else { "TRACE" };
    format!("pkl: {level}: {} ({})", log.message, log.frame_uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_level_message_and_frame() {
        let log = Log {
            evaluator_id: 1,
            level: 1,
            message: "deprecated property".to_owned(),
            frame_uri: "file:///config.pkl#L4".to_owned(),
        };
        assert_eq!(
            render(&log),
            "pkl: WARN: deprecated property (file:///config.pkl#L4)"
        );
    }
}
