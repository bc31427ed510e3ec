use crate::archive::read_files;
use crate::backend::{
    short_id, tail_lines, ContainerInfo, ContainerSpec, ContainerStatus, EngineClient,
    ExecOutput, ExecSpec,
};
use crate::EngineError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    image: String,
    status: ContainerStatus,
    files: BTreeMap<String, Vec<u8>>,
    users: BTreeSet<String>,
    log: Vec<String>,
}

impl MockContainer {
    fn info(&self, name: &str) -> ContainerInfo {
        ContainerInfo {
            id: short_id(&self.id),
            name: name.to_owned(),
            status: self.status,
            image: self.image.clone(),
        }
    }
}

/// In-memory engine for tests and local runs.
///
/// Understands a handful of in-container commands (`cat <path>`, `exit <n>`,
/// `useradd`, `chpasswd`); everything else is echoed back with exit code 0.
pub struct MockEngine {
    state: Mutex<HashMap<String, MockContainer>>,
    available: AtomicBool,
    exec_delay: Mutex<Duration>,
    next_id: AtomicU64,
    calls: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            exec_delay: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `exec` block for `delay` before answering.
    #[must_use]
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        self.set_exec_delay(delay);
        self
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.exec_delay.lock() {
            *d = delay;
        }
    }

    /// Simulate the engine going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of engine calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable(
                "mock engine marked unavailable".to_owned(),
            ))
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, MockContainer>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.enter()?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| EngineError::Command(format!("mutex poisoned: {e}")))?;
        f(&mut state)
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockContainer) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.with_state(|state| {
            let container = state
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(name.to_owned()))?;
            f(container)
        })
    }

    fn mint_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mixed = n.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        format!("{mixed:016x}{n:048x}")
    }
}

fn exec_in(container: &mut MockContainer, spec: &ExecSpec) -> ExecOutput {
    let words: Vec<&str> = match spec.command.as_slice() {
        [sh, flag, line] if sh == "sh" && flag == "-c" => line.split_whitespace().collect(),
        other => other.iter().map(String::as_str).collect(),
    };

    match words.as_slice() {
        ["cat", path] => match container.files.get(path.trim_start_matches('/')) {
            Some(bytes) => ok(String::from_utf8_lossy(bytes).into_owned()),
            None => failed(1, format!("cat: can't open '{path}': No such file or directory\n")),
        },
        ["exit", code] => failed(code.parse().unwrap_or(1), String::new()),
        ["useradd", .., username] => {
            if container.users.insert((*username).to_owned()) {
                ok(String::new())
            } else {
                failed(9, format!("useradd: user '{username}' already exists\n"))
            }
        }
        ["chpasswd"] => {
            let input = spec
                .stdin
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            let user = input.split(':').next().unwrap_or_default().trim();
            if container.users.contains(user) {
                ok(String::new())
            } else {
                failed(1, format!("chpasswd: user '{user}' does not exist\n"))
            }
        }
        _ => ok(format!("mock-exec: {}\n", spec.command.join(" "))),
    }
}

fn ok(output: String) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        output,
    }
}

fn failed(exit_code: i64, output: String) -> ExecOutput {
    ExecOutput { exit_code, output }
}

impl EngineClient for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn ping(&self) -> Result<(), EngineError> {
        self.enter()
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let id = self.mint_id();
        self.with_state(|state| {
            if state.contains_key(&spec.name) {
                return Err(EngineError::NameInUse(spec.name.clone()));
            }
            state.insert(
                spec.name.clone(),
                MockContainer {
                    id: id.clone(),
                    image: spec.image.clone(),
                    status: ContainerStatus::Created,
                    files: BTreeMap::new(),
                    users: BTreeSet::from(["root".to_owned()]),
                    log: Vec::new(),
                },
            );
            Ok(id)
        })
    }

    fn start(&self, name: &str) -> Result<(), EngineError> {
        self.with_container(name, |c| {
            if c.status != ContainerStatus::Running {
                c.status = ContainerStatus::Running;
                c.log.push(format!("mock: started {}", c.image));
            }
            Ok(())
        })
    }

    fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.with_container(name, |c| {
            if c.status == ContainerStatus::Running {
                c.status = ContainerStatus::Exited;
                c.log.push("mock: stopped".to_owned());
            }
            Ok(())
        })
    }

    fn remove(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.with_state(|state| {
            let container = state
                .get(name)
                .ok_or_else(|| EngineError::NotFound(name.to_owned()))?;
            if container.status == ContainerStatus::Running && !force {
                return Err(EngineError::Command(format!(
                    "podman rm: Error: cannot remove container {} as it is running - \
                     running or paused containers cannot be removed without force: \
                     container state improper",
                    short_id(&container.id)
                )));
            }
            state.remove(name);
            Ok(())
        })
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo, EngineError> {
        self.with_container(name, |c| Ok(c.info(name)))
    }

    fn list(&self, all: bool) -> Result<Vec<ContainerInfo>, EngineError> {
        self.with_state(|state| {
            let mut list: Vec<ContainerInfo> = state
                .iter()
                .filter(|(_, c)| all || c.status == ContainerStatus::Running)
                .map(|(name, c)| c.info(name))
                .collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(list)
        })
    }

    fn logs(&self, name: &str, tail: Option<usize>) -> Result<String, EngineError> {
        self.with_container(name, |c| {
            let mut text = c.log.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            Ok(tail_lines(&text, tail))
        })
    }

    fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError> {
        self.with_container(name, |c| {
            if c.status != ContainerStatus::Running {
                return Err(EngineError::NotRunning(name.to_owned()));
            }
            Ok(())
        })?;

        let delay = self.exec_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.with_container(name, |c| Ok(exec_in(c, spec)))
    }

    fn copy_in(&self, name: &str, dest_dir: &str, archive: &[u8]) -> Result<(), EngineError> {
        let files = read_files(archive)?;
        self.with_container(name, |c| {
            for (path, content) in files {
                let full = Path::new(dest_dir.trim_start_matches('/')).join(path);
                c.files
                    .insert(full.to_string_lossy().into_owned(), content);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::single_file_archive;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            image: "alpine:latest".to_owned(),
            name: name.to_owned(),
            command: Some("sleep 300".to_owned()),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn mock_lifecycle() {
        let engine = MockEngine::new();
        let id = engine.create(&spec("demo")).unwrap();
        assert_eq!(id.len(), 64);
        assert_eq!(
            engine.inspect("demo").unwrap().status,
            ContainerStatus::Created
        );

        engine.start("demo").unwrap();
        let info = engine.inspect("demo").unwrap();
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.id, short_id(&id));

        engine.stop("demo").unwrap();
        assert_eq!(engine.inspect("demo").unwrap().status, ContainerStatus::Exited);
        // stopping twice is fine
        engine.stop("demo").unwrap();

        engine.remove("demo", false).unwrap();
        assert!(matches!(engine.inspect("demo"), Err(EngineError::NotFound(_))));
        assert!(matches!(engine.remove("demo", false), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn mock_ids_are_distinct() {
        let engine = MockEngine::new();
        let a = engine.create(&spec("a")).unwrap();
        let b = engine.create(&spec("b")).unwrap();
        assert_ne!(short_id(&a), short_id(&b));
    }

    #[test]
    fn duplicate_name_rejected() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        assert!(matches!(
            engine.create(&spec("demo")),
            Err(EngineError::NameInUse(_))
        ));
    }

    #[test]
    fn remove_running_requires_force() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        engine.start("demo").unwrap();
        let err = engine.remove("demo", false).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("without force"));
        assert!(text.ends_with("container state improper"));
        engine.remove("demo", true).unwrap();
    }

    #[test]
    fn exec_requires_running() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        assert!(matches!(
            engine.exec("demo", &ExecSpec::shell("true")),
            Err(EngineError::NotRunning(_))
        ));
        assert!(matches!(
            engine.exec("ghost", &ExecSpec::shell("true")),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn exec_exit_code_and_echo() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        engine.start("demo").unwrap();

        let out = engine.exec("demo", &ExecSpec::shell("exit 3")).unwrap();
        assert_eq!(out.exit_code, 3);

        let out = engine.exec("demo", &ExecSpec::shell("uname -a")).unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("uname -a"));
    }

    #[test]
    fn copy_in_then_cat() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        engine.start("demo").unwrap();

        let content = "hello\nworld\n";
        let archive = single_file_archive("/tmp/hello.txt", content.as_bytes()).unwrap();
        engine.copy_in("demo", "/", &archive).unwrap();

        let out = engine.exec("demo", &ExecSpec::shell("cat /tmp/hello.txt")).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output, content);

        let out = engine.exec("demo", &ExecSpec::shell("cat /tmp/missing")).unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[test]
    fn useradd_and_chpasswd() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        engine.start("demo").unwrap();

        let add = ExecSpec::new(
            ["useradd", "-m", "-s", "/bin/sh", "alice"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        );
        assert_eq!(engine.exec("demo", &add).unwrap().exit_code, 0);
        assert_eq!(engine.exec("demo", &add).unwrap().exit_code, 9);

        let passwd = ExecSpec::new(vec!["chpasswd".to_owned()]).with_stdin(b"alice:pw\n".to_vec());
        assert_eq!(engine.exec("demo", &passwd).unwrap().exit_code, 0);

        let passwd = ExecSpec::new(vec!["chpasswd".to_owned()]).with_stdin(b"bob:pw\n".to_vec());
        assert_eq!(engine.exec("demo", &passwd).unwrap().exit_code, 1);
    }

    #[test]
    fn logs_tail() {
        let engine = MockEngine::new();
        engine.create(&spec("demo")).unwrap();
        engine.start("demo").unwrap();
        engine.stop("demo").unwrap();
        engine.start("demo").unwrap();

        let all = engine.logs("demo", None).unwrap();
        assert_eq!(all.lines().count(), 3);
        let last = engine.logs("demo", Some(1)).unwrap();
        assert_eq!(last, "mock: started alpine:latest\n");
    }

    #[test]
    fn list_filters_running() {
        let engine = MockEngine::new();
        engine.create(&spec("b")).unwrap();
        engine.create(&spec("a")).unwrap();
        engine.start("a").unwrap();

        let all = engine.list(true).unwrap();
        assert_eq!(
            all.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let running = engine.list(false).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "a");
    }

    #[test]
    fn unavailable_engine_fails_every_call() {
        let engine = MockEngine::new();
        engine.set_available(false);
        assert!(matches!(engine.ping(), Err(EngineError::Unavailable(_))));
        assert!(matches!(engine.list(true), Err(EngineError::Unavailable(_))));
        engine.set_available(true);
        assert!(engine.ping().is_ok());
    }

    #[test]
    fn calls_are_counted() {
        let engine = MockEngine::new();
        assert_eq!(engine.calls(), 0);
        engine.ping().unwrap();
        let _ = engine.inspect("ghost");
        assert_eq!(engine.calls(), 2);
    }
}
