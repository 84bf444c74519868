//! Lifecycle hooks: child-process invocation on engine events.
//!
//! When a hook script is configured, the engine spawns it detached on every
//! lifecycle event with the arguments `[script, event-name, instance-id,
//! ...event args]`. Only `namespaces-init` is waited on (it may prepare the
//! storage directories); everything else runs in the background and is
//! reaped opportunistically.

use std::path::PathBuf;
use std::process::{Child, Command};

/// Hook runner owned by the engine.
#[derive(Debug)]
pub(crate) struct Hooks {
    script: Option<PathBuf>,
    instance: String,
    children: Vec<Child>,
}

impl Hooks {
    pub fn new(script: Option<PathBuf>, instance: String) -> Self {
        Self {
            script,
            instance,
            children: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.script.is_some()
    }

    fn spawn(&mut self, event: &str, args: &[&str]) -> Option<Child> {
        let script = self.script.as_ref()?;
        tracing::debug!(event, ?args, "hook: executing");

        match Command::new(script)
            .arg(event)
            .arg(&self.instance)
            .args(args)
            .spawn()
        {
            Ok(child) => Some(child),
            Err(e) => {
                tracing::warn!(event, error = %e, "hook: spawn failed");
                None
            }
        }
    }

    /// Fires an event without waiting for the script to finish.
    pub fn fire(&mut self, event: &str, args: &[&str]) {
        if let Some(child) = self.spawn(event, args) {
            self.children.push(child);
        }
    }

    /// Fires an event and waits for the script, returning its exit code.
    pub fn fire_wait(&mut self, event: &str, args: &[&str]) -> Option<i32> {
        let mut child = self.spawn(event, args)?;

        match child.wait() {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(event, error = %e, "hook: wait failed");
                None
            }
        }
    }

    /// Reaps finished hook children. Cheap; meant to be called from the
    /// serving loop between commands.
    pub fn cleanup(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), status = status.code(), "hook: terminated");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "hook: wait failed, dropping child");
                false
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.children.len()
    }
}

impl Drop for Hooks {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_hooks_fire_nothing() {
        let mut hooks = Hooks::new(None, "unknown-id".into());
        assert!(!hooks.enabled());

        hooks.fire("ready", &[]);
        assert_eq!(hooks.pending(), 0);
        assert_eq!(hooks.fire_wait("namespaces-init", &["a", "b"]), None);
    }

    #[test]
    fn fired_hooks_receive_event_and_instance() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hook.sh");
        let out = dir.path().join("out");

        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1 $2 $3\" > {}\n", out.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut hooks = Hooks::new(Some(script), "tcp://127.0.0.1:9900".into());
        let status = hooks.fire_wait("namespace-created", &["default"]);
        assert_eq!(status, Some(0));

        let logged = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            logged.trim(),
            "namespace-created tcp://127.0.0.1:9900 default"
        );
    }
}
