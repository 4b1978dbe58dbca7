use std::path::PathBuf;
use std::sync::Arc;

use log::*;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rule::RuleContext;
use crate::rule_set::{parse_rules, RuleSet};

/// Fills a rule-set from a file and, when asked, reloads it on change.
#[derive(Debug)]
pub struct LocalLoader {
    set: Arc<RuleSet>,
    path: PathBuf,
    format: String,
    watch: bool,
    ctx: RuleContext,
}

impl LocalLoader {
    pub fn new(set: Arc<RuleSet>, path: PathBuf, format: String, watch: bool, ctx: RuleContext) -> Self {
        Self {
            set,
            path,
            format,
            watch,
            ctx,
        }
    }

    pub fn reload(&self) -> Result<()> {
        let content = std::fs::read(&self.path)?;
        let rules = parse_rules(&content, &self.format, &self.ctx)
            .map_err(|err| Error::rule_set(self.set.tag(), err))?;
        self.set.reload(rules);
        Ok(())
    }

    /// Starts watching the file when enabled; the watch ends with `cancel`.
    pub fn spawn_watch(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if !self.watch {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(err) => warn!("rule-set watch: {}", err),
            }
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        debug!("rule-set[{}]: watching {}", self.set.tag(), self.path.display());

        tokio::spawn(async move {
            // dropping the watcher stops the notifications
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // an editor save is several events
                        while rx.try_recv().is_ok() {}
                        match self.reload() {
                            Ok(()) => info!("rule-set[{}]: reloaded, {} rules", self.set.tag(), self.set.len()),
                            Err(err) => error!("reload rule-set {}: {}", self.set.tag(), err),
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": 2, "rules": [{{"domain": "a.example"}}]}}"#).unwrap();
        let set = Arc::new(RuleSet::new("file"));
        let loader = LocalLoader::new(
            set.clone(),
            file.path().to_path_buf(),
            "source".into(),
            false,
            RuleContext::default(),
        );
        loader.reload().unwrap();
        assert_eq!(set.len(), 1);

        let mut file = file.reopen().unwrap();
        file.set_len(0).unwrap();
        write!(file, "not json").unwrap();
        let err = loader.reload().unwrap_err();
        assert!(err.to_string().starts_with("rule-set[file]: "), "{}", err);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn missing_file() {
        let set = Arc::new(RuleSet::new("file"));
        let loader = LocalLoader::new(
            set,
            PathBuf::from("/nonexistent/rules.json"),
            "source".into(),
            false,
            RuleContext::default(),
        );
        assert!(matches!(loader.reload(), Err(Error::Io(_))));
    }
}
