//! Internal event listeners: the container-event consumer and the console
//! output pipeline. These live for the whole life of the server and are
//! only torn down by deletion.

use std::sync::Arc;

use roost_env::{ProcessState, Stats, StopType};
use roost_events::topic;
use roost_system::strip_ansi;
use serde_json::json;

use crate::Server;

/// Wires the environment's bus and console stream into the server: stats
/// enrichment, disk limiter, state bookkeeping, crash detection, and the
/// console matchers.
pub(crate) fn start_event_listeners(server: &Arc<Server>) {
    let console_server = Arc::downgrade(server);
    server
        .environment()
        .set_log_callback(Arc::new(move |line: &str| {
            if let Some(server) = console_server.upgrade() {
                server.process_console_line(line);
            }
        }));

    let mut rx = server.environment().events().channel(64);
    let listener = Arc::clone(server);
    tokio::spawn(async move {
        let mut previous_state = listener.state();
        loop {
            let event = tokio::select! {
                () = listener.context().cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event.topic.as_str() {
                topic::STATS => {
                    if let Ok(stats) = serde_json::from_value::<Stats>(event.data) {
                        listener.resources.update(
                            stats,
                            listener.filesystem().cached_usage(),
                            listener.environment().uptime(),
                        );
                    }
                    // Refresh the usage walk opportunistically; it is cheap
                    // when the cache is fresh.
                    {
                        let fs = Arc::clone(listener.filesystem());
                        let _ = tokio::task::spawn_blocking(move || fs.disk_usage(false)).await;
                    }
                    if listener.filesystem().limit() > 0
                        && !listener.filesystem().has_space_available()
                    {
                        listener.trigger_disk_limiter();
                    }
                    listener
                        .events()
                        .publish(topic::STATS, listener.stats_payload());
                }
                topic::STATUS => {
                    let state = serde_json::from_value::<ProcessState>(
                        event.data.get("state").cloned().unwrap_or_default(),
                    )
                    .unwrap_or(ProcessState::Offline);

                    if state == ProcessState::Starting {
                        listener.crash.rearm_disk_limiter();
                        listener.throttler.reset();
                    }

                    listener.events().publish(topic::STATUS, event.data);

                    if state == ProcessState::Offline {
                        listener.resources.reset();
                        if previous_state != ProcessState::Offline {
                            listener.handle_unexpected_exit(previous_state).await;
                        }
                    }
                    previous_state = state;
                }
                topic::DOCKER_IMAGE_PULL_STATUS => {
                    listener.events().publish(topic::INSTALL_OUTPUT, event.data);
                }
                topic::DOCKER_IMAGE_PULL_STARTED => {
                    listener.publish_daemon_message(
                        "Pulling container image, this could take a few minutes to complete...",
                    );
                }
                topic::DOCKER_IMAGE_PULL_COMPLETED => {
                    listener.publish_daemon_message("Finished pulling container image.");
                }
                _ => {}
            }
        }
    });
}

impl Server {
    /// Handles one raw console line from the container.
    ///
    /// Matching (start detection, feature matches, stop-command echo) always
    /// runs; the line only reaches the sink, and therefore subscribers, when
    /// the throttler admits it. Over-limit output is still consumed so the
    /// container is never back-pressured.
    pub(crate) fn process_console_line(self: &Arc<Self>, line: &str) {
        self.on_console_output(line);

        if !self.throttler.try_allow() {
            return;
        }
        self.sinks().log().push(line);
    }

    fn on_console_output(self: &Arc<Self>, line: &str) {
        let state = self.environment().state();
        if state != ProcessState::Starting && state != ProcessState::Running {
            return;
        }

        let proc_cfg = self.process_configuration();
        let stripped;
        let line_for_match = if proc_cfg.startup.strip_ansi {
            stripped = strip_ansi(line);
            stripped.as_str()
        } else {
            line
        };

        if state == ProcessState::Starting {
            // Empty done-pattern lists mark the server running on first
            // output; otherwise the first matching line wins.
            let done = &proc_cfg.startup.done;
            let matched = done.is_empty()
                || done.iter().any(|pattern| line_for_match.contains(pattern));
            if matched {
                tracing::debug!(server = %self.id(), line = %line_for_match, "detected server in running state from console output");
                self.environment().set_state(ProcessState::Running);
            }
        }

        let features = &self.config().egg.features;
        if !features.is_empty() {
            let lower = line_for_match.to_lowercase();
            'outer: for (key, patterns) in features {
                for pattern in patterns {
                    if lower.contains(&pattern.to_lowercase()) {
                        self.events().publish(
                            topic::FEATURE_MATCH,
                            json!({
                                "key": key,
                                "pattern": pattern,
                                "line": line_for_match,
                            }),
                        );
                        // One trigger per console line.
                        break 'outer;
                    }
                }
            }
        }

        // A user typing the configured stop command must flip the state
        // before exit, otherwise crash detection restarts the server under
        // them.
        if self.environment().state() == ProcessState::Running {
            let stop = &proc_cfg.stop;
            if stop.kind == StopType::Command && line_for_match == stop.value {
                self.environment().set_state(ProcessState::Offline);
            }
        }
    }
}
