//! Execution engine: one write → invoke → read sequence on a loaded module

use crate::codec;
use crate::error::{BridgeError, CodecError, Result};
use crate::loader::PipelineModule;
use crate::runtime::ModuleInstance;
use crate::types::{DataDescriptor, OutputSpec, PipelineInput};
use crate::vfs::VirtualFs;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one module invocation
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Module exit code
    pub return_value: i32,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Populated outputs in requested order; empty unless `return_value` is 0
    pub outputs: Vec<DataDescriptor>,

    /// Wall time spent inside the module lock
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.return_value == 0
    }
}

/// Run `module` with `args` (argv[0] is the module name)
///
/// A non-zero exit code is a normal result with no outputs. A native fault
/// becomes [`BridgeError::Execution`] carrying whatever the module printed.
/// The module runs on a blocking thread while its lock is held, and its
/// sandbox is emptied before the lock is released.
pub async fn run(
    module: &PipelineModule,
    args: &[String],
    outputs: &[OutputSpec],
    inputs: &[PipelineInput],
) -> Result<ExecutionResult> {
    let argv: Vec<String> = std::iter::once(module.name().to_string())
        .chain(args.iter().cloned())
        .collect();
    info!("Running {} {}", module.name(), args.join(" "));

    let name = module.name().to_string();
    let outputs = outputs.to_vec();
    let inputs = inputs.to_vec();
    let mut instance = module.lock_owned().await;
    let started = Instant::now();

    let invocation = tokio::task::spawn_blocking(move || {
        invoke_locked(instance.as_mut(), &name, &argv, &outputs, &inputs)
    })
    .await
    .map_err(|e| BridgeError::Execution {
        message: format!("{} did not complete: {}", module.name(), e),
        stdout: String::new(),
        stderr: String::new(),
    })??;
    let Invocation {
        outcome,
        stdout,
        stderr,
    } = invocation;

    let (return_value, outputs) = match outcome {
        Ok(done) => done,
        Err(Failure::Fault(message)) => {
            warn!("{} faulted: {}", module.name(), message);
            return Err(BridgeError::Execution {
                message,
                stdout,
                stderr,
            });
        }
        Err(Failure::Bridge(e)) => return Err(e),
    };

    let duration = started.elapsed();
    debug!(
        "{} returned {} with {} outputs in {:.2?}",
        module.name(),
        return_value,
        outputs.len(),
        duration
    );
    Ok(ExecutionResult {
        return_value,
        stdout,
        stderr,
        outputs,
        duration,
    })
}

enum Failure {
    Fault(String),
    Bridge(BridgeError),
}

impl From<CodecError> for Failure {
    fn from(e: CodecError) -> Self {
        Failure::Bridge(e.into())
    }
}

struct Invocation {
    outcome: std::result::Result<(i32, Vec<DataDescriptor>), Failure>,
    stdout: String,
    stderr: String,
}

/// prepare → execute → release on an instance the caller has locked
fn invoke_locked(
    instance: &mut dyn ModuleInstance,
    name: &str,
    argv: &[String],
    outputs: &[OutputSpec],
    inputs: &[PipelineInput],
) -> Result<Invocation> {
    instance
        .prepare(argv)
        .map_err(|e| BridgeError::Execution {
            message: format!("{} could not be started: {}", name, e),
            stdout: String::new(),
            stderr: String::new(),
        })?;

    let outcome = execute(instance, outputs, inputs);
    let stdout = instance.stdout();
    let stderr = instance.stderr();
    instance.release(match &outcome {
        Ok((return_value, _)) => *return_value,
        Err(_) => 1,
    });

    // Files of this call must not be visible to the next one
    if let Err(e) = VirtualFs::new(instance.filesystem()).clear() {
        warn!("Clearing the sandbox of {} failed: {}", name, e);
    }

    Ok(Invocation {
        outcome,
        stdout,
        stderr,
    })
}

fn execute(
    instance: &mut dyn ModuleInstance,
    outputs: &[OutputSpec],
    inputs: &[PipelineInput],
) -> std::result::Result<(i32, Vec<DataDescriptor>), Failure> {
    for (index, input) in inputs.iter().enumerate() {
        codec::write_input(instance, index, input)?;
    }

    let return_value = instance
        .invoke()
        .map_err(|fault| Failure::Fault(fault.message))?;
    if return_value != 0 {
        return Ok((return_value, Vec::new()));
    }

    let populated = outputs
        .iter()
        .enumerate()
        .map(|(index, expected)| codec::read_output(instance, index, expected))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((return_value, populated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ModuleRuntime, NativeContext, NativeRuntime};
    use crate::types::{BinaryFile, BinaryStream, TextStream, TypedBuffer};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn module(runtime: &NativeRuntime, name: &str) -> PipelineModule {
        let instance = runtime.instantiate(name, &[]).unwrap();
        PipelineModule::new(name, format!("test/{name}.wasm"), instance)
    }

    fn text(data: &str) -> PipelineInput {
        DataDescriptor::TextStream(TextStream {
            data: data.to_string(),
        })
        .into()
    }

    #[tokio::test]
    async fn test_argv_starts_with_module_name() {
        let runtime = NativeRuntime::new();
        runtime.register("echo-args", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let line = ctx.argv().join(",");
            ctx.set_output_text(0, &line)?;
            Ok(0)
        });
        let module = module(&runtime, "echo-args");
        let args = vec!["a".to_string(), "--memory-io".to_string()];

        let result = run(&module, &args, &[OutputSpec::TextStream], &[]).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(
            result.outputs,
            vec![DataDescriptor::TextStream(TextStream {
                data: "echo-args,a,--memory-io".to_string()
            })]
        );
    }

    #[tokio::test]
    async fn test_nonzero_return_has_no_outputs() {
        let runtime = NativeRuntime::new();
        runtime.register("reject", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            ctx.eprint("not my format");
            ctx.set_output_text(0, "ignored")?;
            Ok(1)
        });
        let module = module(&runtime, "reject");

        let result = run(&module, &[], &[OutputSpec::TextStream], &[text("x")])
            .await
            .unwrap();
        assert_eq!(result.return_value, 1);
        assert!(result.outputs.is_empty());
        assert_eq!(result.stderr, "not my format\n");
    }

    #[tokio::test]
    async fn test_fault_carries_captured_output() {
        let runtime = NativeRuntime::new();
        runtime.register("trap", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            ctx.print("reading header");
            Err("unreachable executed".to_string())
        });
        let module = module(&runtime, "trap");

        match run(&module, &[], &[], &[]).await {
            Err(BridgeError::Execution {
                message, stdout, ..
            }) => {
                assert_eq!(message, "unreachable executed");
                assert_eq!(stdout, "reading header\n");
            }
            other => panic!("Expected Execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outputs_survive_memory_reuse() {
        let runtime = NativeRuntime::new();
        runtime.register("reverse", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let mut bytes = ctx.input_array(0, 0)?;
            bytes.reverse();
            ctx.set_output_bytes(0, &bytes)?;
            Ok(0)
        });
        let module = module(&runtime, "reverse");
        let input = |bytes: &[u8]| -> PipelineInput {
            DataDescriptor::BinaryStream(BinaryStream {
                data: TypedBuffer::from_u8s(bytes),
            })
            .into()
        };

        let first = run(&module, &[], &[OutputSpec::BinaryStream], &[input(&[1, 2, 3, 4])])
            .await
            .unwrap();
        let snapshot = first.outputs.clone();
        let second = run(&module, &[], &[OutputSpec::BinaryStream], &[input(&[9, 9, 9, 9])])
            .await
            .unwrap();

        assert_eq!(first.outputs, snapshot);
        match (&first.outputs[0], &second.outputs[0]) {
            (DataDescriptor::BinaryStream(a), DataDescriptor::BinaryStream(b)) => {
                assert_eq!(a.data.as_bytes(), &[4, 3, 2, 1]);
                assert_eq!(b.data.as_bytes(), &[9, 9, 9, 9]);
            }
            _ => panic!("Expected binary streams"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_output_is_codec_error() {
        let runtime = NativeRuntime::new();
        runtime.register("silent", |_: &mut NativeContext<'_>| Ok(0));
        let module = module(&runtime, "silent");

        let err = run(&module, &[], &[OutputSpec::image()], &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)));
    }

    #[tokio::test]
    async fn test_output_files_do_not_leak_into_next_call() {
        let runtime = NativeRuntime::new();
        runtime.register("maybe-write", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            if ctx.argv().get(1).map(String::as_str) == Some("write") {
                ctx.write_file("out.bin", b"from the first call")?;
            }
            Ok(0)
        });
        let module = module(&runtime, "maybe-write");
        let expected = [OutputSpec::BinaryFile {
            path: "out.bin".to_string(),
        }];

        let first = run(&module, &["write".to_string()], &expected, &[])
            .await
            .unwrap();
        match &first.outputs[0] {
            DataDescriptor::BinaryFile(file) => {
                assert_eq!(file.data.as_bytes(), b"from the first call")
            }
            other => panic!("Expected BinaryFile, got {}", other.type_name()),
        }

        let err = run(&module, &["skip".to_string()], &expected, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Codec(CodecError::Io(_))), "{err:?}");
    }

    #[tokio::test]
    async fn test_sandbox_is_emptied_after_every_call() {
        let runtime = NativeRuntime::new();
        runtime.register("size", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let path = ctx.argv()[1].clone();
            let bytes = ctx.read_file(&path)?;
            ctx.write_file("scratch/size.txt", bytes.len().to_string().as_bytes())?;
            Ok(if bytes.is_empty() { 1 } else { 0 })
        });
        let module = module(&runtime, "size");
        let file = |path: &str, bytes: &[u8]| -> PipelineInput {
            DataDescriptor::BinaryFile(BinaryFile {
                path: path.to_string(),
                data: TypedBuffer::from_u8s(bytes),
            })
            .into()
        };

        for (index, bytes) in [&b"abc"[..], &b""[..], &b"de"[..]].into_iter().enumerate() {
            let path = format!("input-{index}.bin");
            run(&module, &[path.clone()], &[], &[file(&path, bytes)])
                .await
                .unwrap();
            let instance = module.lock().await;
            let entries = std::fs::read_dir(instance.filesystem()).unwrap().count();
            assert_eq!(entries, 0, "sandbox not emptied after call {index}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_calls_on_one_module_are_serialized() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runtime = NativeRuntime::new();
        {
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            runtime.register("slow-echo", move |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                let text = ctx.input_text(0)?;
                std::thread::sleep(std::time::Duration::from_millis(50));
                ctx.set_output_text(0, &text)?;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            });
        }
        let module = Arc::new(module(&runtime, "slow-echo"));
        let expected = [OutputSpec::TextStream];

        let first_input = [text("first")];
        let second_input = [text("second")];
        let (first, second) = tokio::join!(
            run(&module, &[], &expected, &first_input),
            run(&module, &[], &expected, &second_input),
        );

        assert!(!overlapped.load(Ordering::SeqCst));
        let echoed = |result: Result<ExecutionResult>| match result.unwrap().outputs.remove(0) {
            DataDescriptor::TextStream(stream) => stream.data,
            other => panic!("Expected TextStream, got {}", other.type_name()),
        };
        assert_eq!(echoed(first), "first");
        assert_eq!(echoed(second), "second");
    }
}
