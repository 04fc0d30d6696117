//! Tests for the sandbox supervisor, registry, language plan, and transport

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use runbox::archive;
    use runbox::backend::registry;
    use runbox::tools::{RunCodeArgs, RunCodeTool};
    use runbox::{
        Backend, BackendKind, CommandResult, ExecOptions, FileType, SandboxError, SandboxHandle,
        Session, SupportedLanguage,
    };

    /// The registry is process-wide; tests that touch the canonical keys
    /// take this lock so they do not trample each other's fakes.
    static REGISTRY_LOCK: Mutex<()> = Mutex::new(());

    // ==================== Fake backend ====================

    #[derive(Clone, Default)]
    struct FakeBackend {
        events: Arc<Mutex<Vec<String>>>,
        execs: Arc<Mutex<Vec<Vec<String>>>>,
        run_result: CommandResult,
        files: HashMap<String, Vec<u8>>,
        fail_create: bool,
        fail_start: bool,
        fail_exec: bool,
    }

    impl FakeBackend {
        fn event(&self, name: &str) {
            self.events.lock().unwrap().push(name.to_string());
        }

        fn count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == name)
                .count()
        }

        fn install(&self, key: &str) {
            let fake = self.clone();
            registry::register(
                key,
                Arc::new(move || {
                    let fake = fake.clone();
                    Box::pin(async move { Ok(Box::new(fake) as Box<dyn Backend>) })
                }),
            );
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::LocalEngine
        }

        async fn create(&self, _language: SupportedLanguage) -> Result<SandboxHandle, SandboxError> {
            self.event("create");
            if self.fail_create {
                return Err(SandboxError::backend("create refused"));
            }
            Ok(SandboxHandle::new(BackendKind::LocalEngine, "fake-sandbox"))
        }

        async fn start(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
            self.event("start");
            if self.fail_start {
                return Err(SandboxError::backend("start refused"));
            }
            Ok(())
        }

        async fn exec(
            &self,
            _handle: &SandboxHandle,
            argv: &[String],
            _options: ExecOptions,
        ) -> Result<CommandResult, SandboxError> {
            self.event("exec");
            self.execs.lock().unwrap().push(argv.to_vec());
            if self.fail_exec {
                return Err(SandboxError::backend("exec channel lost"));
            }
            // Source materialisation must succeed for the run to proceed
            if argv.first().map(String::as_str) == Some("sh")
                && argv.iter().any(|a| a.contains("base64 -d"))
            {
                return Ok(CommandResult::default());
            }
            Ok(self.run_result.clone())
        }

        async fn put(
            &self,
            _handle: &SandboxHandle,
            _host_path: &Path,
            _sandbox_path: &str,
        ) -> Result<(), SandboxError> {
            self.event("put");
            Ok(())
        }

        async fn get(
            &self,
            _handle: &SandboxHandle,
            sandbox_path: &str,
        ) -> Result<(Vec<u8>, archive::ArchiveStat), SandboxError> {
            self.event("get");
            let contents = self
                .files
                .get(sandbox_path)
                .ok_or_else(|| SandboxError::backend(format!("no such file: {sandbox_path}")))?;
            let name = Path::new(sandbox_path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            let packed = archive::pack_file(&name, contents).unwrap();
            let stat = archive::entry_stat(&packed).unwrap();
            Ok((packed, stat))
        }

        async fn destroy(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
            self.event("destroy");
            Ok(())
        }
    }

    fn ok_result(stdout: &str) -> CommandResult {
        CommandResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    // ==================== Language plan ====================

    #[test]
    fn test_language_extensions() {
        assert_eq!(SupportedLanguage::Python.extension(), ".py");
        assert_eq!(SupportedLanguage::Go.extension(), ".go");
        assert_eq!(SupportedLanguage::R.extension(), ".R");
    }

    #[test]
    fn test_install_command_python() {
        let deps = vec!["numpy".to_string(), "pandas".to_string()];
        let argv = SupportedLanguage::Python.install_command(&deps).unwrap();
        assert_eq!(argv, vec!["pip", "install", "--quiet", "numpy", "pandas"]);
    }

    #[test]
    fn test_install_command_noop_languages() {
        let deps = vec!["anything".to_string()];
        assert!(SupportedLanguage::Java.install_command(&deps).is_none());
        assert!(SupportedLanguage::Cpp.install_command(&deps).is_none());
        assert!(SupportedLanguage::R.install_command(&deps).is_none());
    }

    #[test]
    fn test_run_commands() {
        assert_eq!(
            SupportedLanguage::Python.run_command("/sandbox/code_x.py"),
            vec!["python", "/sandbox/code_x.py"]
        );
        assert_eq!(
            SupportedLanguage::Go.run_command("/sandbox/code_x.go"),
            vec!["go", "run", "/sandbox/code_x.go"]
        );
        assert_eq!(SupportedLanguage::Cpp.run_command("/sandbox/code_x.cpp"), vec!["./a.out"]);
    }

    #[test]
    fn test_unsupported_language_rejected() {
        let err = SupportedLanguage::from_str("fortran").unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }

    // ==================== Command result polarity ====================

    #[test]
    fn test_command_result_success() {
        assert!(ok_result("5050\n").success());
        let failed = CommandResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "SyntaxError: invalid syntax".to_string(),
        };
        assert!(!failed.success());
        assert!(failed.stderr.contains("SyntaxError"));
    }

    #[test]
    fn test_file_type_mime() {
        assert_eq!(FileType::from_path("plot.png"), Some(FileType::Png));
        assert_eq!(FileType::from_path("data.csv").unwrap().mime(), "text/csv");
        assert_eq!(FileType::from_path("archive.tar.gz"), None);
        assert_eq!(FileType::from_path("noext"), None);
    }

    // ==================== Archive framing & staging ====================

    #[test]
    fn test_archive_round_trip() {
        let packed = archive::pack_file("hello.txt", b"hello world").unwrap();
        let (name, contents) = archive::unpack_first(&packed).unwrap();
        assert_eq!(name, "hello.txt");
        assert_eq!(contents, b"hello world");

        let stat = archive::entry_stat(&packed).unwrap();
        assert_eq!(stat.name, "hello.txt");
        assert_eq!(stat.size, 11);
    }

    #[test]
    fn test_archive_first_entry_wins() {
        // Concatenate two one-entry archives; only the first entry counts
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in [("first.txt", b"aaa"), ("second.txt", b"bbb")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice()).unwrap();
        }
        let packed = builder.into_inner().unwrap();

        let (name, contents) = archive::unpack_first(&packed).unwrap();
        assert_eq!(name, "first.txt");
        assert_eq!(contents, b"aaa");
    }

    #[test]
    fn test_stage_disambiguates_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        std::fs::write(dir.path().join("a_1.txt"), "old").unwrap();

        let staged = archive::stage(dir.path(), "a.txt", b"new").unwrap();
        assert_eq!(staged.file_name().unwrap(), "a_2.txt");
        assert_eq!(std::fs::read(staged).unwrap(), b"new");
    }

    #[test]
    fn test_stage_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out");
        let staged = archive::stage(&nested, "file.bin", &[1, 2, 3]).unwrap();
        assert!(staged.starts_with(&nested));
        assert_eq!(std::fs::read(staged).unwrap(), vec![1, 2, 3]);
    }

    // ==================== Registry ====================

    #[test]
    fn test_registry_distinct_keys_all_listed() {
        FakeBackend::default().install("reg-test-a");
        FakeBackend::default().install("reg-test-b");
        FakeBackend::default().install("reg-test-c");

        let available = registry::available();
        for key in ["reg-test-a", "reg-test-b", "reg-test-c"] {
            assert!(available.iter().any(|k| k == key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_registry_reregistration_overwrites() {
        registry::register(
            "reg-test-overwrite",
            Arc::new(|| Box::pin(async { Err(SandboxError::backend("old constructor")) })),
        );
        let err = match registry::create("reg-test-overwrite").await {
            Err(e) => e,
            Ok(_) => panic!("old constructor should fail"),
        };
        assert!(err.to_string().contains("old constructor"));

        FakeBackend::default().install("reg-test-overwrite");
        assert!(registry::create("reg-test-overwrite").await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_unknown_key() {
        let err = match registry::create("reg-test-never-registered").await {
            Err(e) => e,
            Ok(_) => panic!("unknown key should not resolve"),
        };
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)));
    }

    // ==================== Session lifecycle ====================

    #[tokio::test]
    async fn test_scope_tears_down_on_success() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            run_result: ok_result("5050\n"),
            ..Default::default()
        };
        fake.install("local_engine");

        let result = Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| {
                Box::pin(async move { session.run_code("print(sum(range(1, 101)))", None).await })
            },
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "5050\n");
        assert_eq!(result.stderr, "");
        assert_eq!(fake.count("create"), 1);
        assert_eq!(fake.count("destroy"), 1);
    }

    #[tokio::test]
    async fn test_scope_tears_down_on_exec_failure() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            fail_exec: true,
            ..Default::default()
        };
        fake.install("local_engine");

        let result = Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| Box::pin(async move { session.run_code("print(1)", None).await }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(fake.count("create"), 1);
        assert_eq!(fake.count("destroy"), 1);
    }

    #[tokio::test]
    async fn test_failed_start_destroys_handle() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            fail_start: true,
            ..Default::default()
        };
        fake.install("local_engine");

        let result = Session::open(BackendKind::LocalEngine, SupportedLanguage::Python).await;
        assert!(result.is_err());
        assert_eq!(fake.count("create"), 1);
        assert_eq!(fake.count("destroy"), 1);
    }

    #[tokio::test]
    async fn test_failed_create_provisions_nothing() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            fail_create: true,
            ..Default::default()
        };
        fake.install("local_engine");

        let result = Session::open(BackendKind::LocalEngine, SupportedLanguage::Python).await;
        assert!(result.is_err());
        assert_eq!(fake.count("start"), 0);
        assert_eq!(fake.count("destroy"), 0);
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // Only the local engine is registered
        FakeBackend::default().install("local_engine");

        let err = match Session::open(BackendKind::Orchestrator, SupportedLanguage::Python).await {
            Err(e) => e,
            Ok(_) => panic!("orchestrator should not be registered yet"),
        };
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)));

        // After registering the orchestrator, the same request succeeds
        FakeBackend::default().install("orchestrator");
        let session = Session::open(BackendKind::Orchestrator, SupportedLanguage::Python)
            .await
            .unwrap();
        session.close().await;
    }

    // ==================== Code materialisation ====================

    #[tokio::test]
    async fn test_code_round_trips_through_base64() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            run_result: ok_result(""),
            ..Default::default()
        };
        fake.install("local_engine");

        let code = "print('héllo — \"world\"')\nprint(1)\n";
        Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| Box::pin(async move { session.run_code(code, None).await }),
        )
        .await
        .unwrap();

        // Find the materialisation command and decode its payload
        let execs = fake.execs.lock().unwrap();
        let write = execs
            .iter()
            .find(|argv| argv.iter().any(|a| a.contains("base64 -d")))
            .expect("no materialisation command issued");
        let script = &write[2];
        let encoded = script
            .strip_prefix("echo ")
            .and_then(|s| s.split(" |").next())
            .unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), code);

        // Generated path follows the /sandbox/code_<hex><ext> convention
        assert!(script.contains("> /sandbox/code_"));
        assert!(script.trim_end().ends_with(".py"));
    }

    #[tokio::test]
    async fn test_install_failure_does_not_abort_run() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            // Every non-materialisation exec reports failure, including the
            // dependency install; the run must still be attempted
            run_result: CommandResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "install blew up".to_string(),
            },
            ..Default::default()
        };
        fake.install("local_engine");

        let result = Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| {
                Box::pin(async move {
                    session
                        .run_code("import numpy", Some(vec!["numpy".to_string()]))
                        .await
                })
            },
        )
        .await
        .unwrap();

        // The run happened and reported its own (non-zero) result
        assert_eq!(result.exit_code, 1);
        let execs = fake.execs.lock().unwrap();
        assert!(execs.iter().any(|argv| argv.first().map(String::as_str) == Some("pip")));
        assert!(execs.iter().any(|argv| argv.first().map(String::as_str) == Some("python")));
    }

    // ==================== Artifact collection ====================

    #[tokio::test]
    async fn test_artifact_staging_and_resilience() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let out_dir = tempfile::tempdir().unwrap();
        let fake = FakeBackend {
            run_result: ok_result(""),
            files: HashMap::from([("/sandbox/test12.txt".to_string(), b"hello".to_vec())]),
            ..Default::default()
        };
        fake.install("local_engine");

        let out_path = out_dir.path().to_path_buf();
        let result = Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| {
                Box::pin(async move {
                    session.set_output_dir(out_path);
                    session
                        .run_code_with_artifacts(
                            "open('test12.txt','w').write('hello')",
                            None,
                            &["test12.txt".to_string(), "missing.txt".to_string()],
                        )
                        .await
                })
            },
        )
        .await
        .unwrap();

        // Two requested, one produced: the call still succeeds with one handle
        assert!(result.success());
        assert_eq!(result.artifacts.len(), 1);
        let artifact = &result.artifacts[0];
        assert_eq!(artifact.logical_name, "test12.txt");
        assert_eq!(artifact.size, 5);
        assert_eq!(artifact.file_type, Some(FileType::Txt));
        assert_eq!(std::fs::read(&artifact.host_path).unwrap(), b"hello");
        assert_eq!(fake.count("destroy"), 1);
    }

    // ==================== Run-code tool ====================

    #[tokio::test]
    async fn test_tool_rejects_unknown_language_before_provisioning() {
        let args = RunCodeArgs {
            code: "print(1)".to_string(),
            language: "fortran".to_string(),
            libraries: None,
            file_paths: None,
            backend: None,
        };
        let err = match RunCodeTool::call(args).await {
            Err(e) => e,
            Ok(_) => panic!("fortran should be rejected before provisioning"),
        };
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }

    #[tokio::test]
    async fn test_tool_defaults_to_python_on_local_engine() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            run_result: ok_result("hi\n"),
            ..Default::default()
        };
        fake.install("local_engine");

        let args: RunCodeArgs =
            serde_json::from_value(serde_json::json!({ "code": "print('hi')" })).unwrap();
        assert_eq!(args.language, "python");

        let execution = RunCodeTool::call(args).await.unwrap();
        assert_eq!(execution.output.stdout, "hi\n");
        assert!(execution.artifacts.is_empty());
        assert_eq!(fake.count("create"), 1);
        assert_eq!(fake.count("destroy"), 1);
    }

    #[tokio::test]
    async fn test_run_checks_request_language() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend {
            run_result: ok_result("ok\n"),
            ..Default::default()
        };
        fake.install("local_engine");

        let mut session = Session::open(BackendKind::LocalEngine, SupportedLanguage::Python)
            .await
            .unwrap();

        let mismatched = runbox::ArtifactRequest {
            request: runbox::ExecutionRequest::new("puts 1", SupportedLanguage::Ruby),
            artifact_paths: vec![],
        };
        assert!(session.run(&mismatched).await.is_err());

        let matched = runbox::ArtifactRequest {
            request: runbox::ExecutionRequest::new("print(1)", SupportedLanguage::Python),
            artifact_paths: vec![],
        };
        let result = session.run(&matched).await.unwrap();
        assert_eq!(result.output.stdout, "ok\n");
        session.close().await;
    }

    #[tokio::test]
    async fn test_put_file_reaches_backend() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let fake = FakeBackend::default();
        fake.install("local_engine");

        let dir = tempfile::tempdir().unwrap();
        let host_file = dir.path().join("input.csv");
        std::fs::write(&host_file, "a,b\n1,2\n").unwrap();

        let mut session = Session::open(BackendKind::LocalEngine, SupportedLanguage::Python)
            .await
            .unwrap();
        session
            .put_file(&host_file, "/sandbox/input.csv")
            .await
            .unwrap();
        assert_eq!(fake.count("put"), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_artifact_names_disambiguated_per_run() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let out_dir = tempfile::tempdir().unwrap();
        std::fs::write(out_dir.path().join("plot.png"), "old").unwrap();

        let fake = FakeBackend {
            run_result: ok_result(""),
            files: HashMap::from([("/sandbox/plot.png".to_string(), b"image".to_vec())]),
            ..Default::default()
        };
        fake.install("local_engine");

        let out_path = out_dir.path().to_path_buf();
        let result = Session::scope(
            BackendKind::LocalEngine,
            SupportedLanguage::Python,
            |session| {
                Box::pin(async move {
                    session.set_output_dir(out_path);
                    session
                        .run_code_with_artifacts("...", None, &["plot.png".to_string()])
                        .await
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(result.artifacts[0].host_path.file_name().unwrap(), "plot_1.png");
    }
}
