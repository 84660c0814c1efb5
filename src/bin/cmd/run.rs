use std::ffi::OsString;

use clap::Args;
use log::{info, warn};
use pebridge::bootstrap::{self, BootEnv, Bootstrap, Decision, HostOs};
use pebridge::loader::{ProcessArgs, Result as LoaderResult};

use super::LoaderOpts;

#[derive(Args)]
pub struct Cmd {
    /// Program to start
    pub program: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cmd {
    pub fn execute(&self, opts: &LoaderOpts) -> LoaderResult<()> {
        let boot = Bootstrap::new(
            HostOs::current(),
            opts.profile(),
            opts.search_paths(),
            BootEnv::from_process(),
        );
        let argv: Vec<OsString> = std::env::args_os().collect();
        if let Decision::Reexec(plan) = boot.decide(&argv) {
            let e = plan.exec();
            bootstrap::fatal(format!("could not exec the loader: {e}"));
        }

        let loader = opts.loader();
        let process = ProcessArgs {
            argv: std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect(),
            envp: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
        };

        let core = boot
            .start(&loader, |core| core.clone())
            .unwrap_or_else(|e| {
                bootstrap::fatal(format!("failed to load {}: {e}", opts.core_module))
            });
        let Some(start) = core.entry_points.ldr_initialize_thunk else {
            bootstrap::fatal("LdrInitializeThunk not found in the core runtime");
        };

        match loader.load_builtin(&self.program) {
            Ok(program) => {
                loader.init_module(program.module, &process, |routine, _| {
                    info!("init routine at {routine:#x}");
                })?;
                println!(
                    "{} mapped at {}, entry point {:#x}",
                    self.program, program.module, program.image.entry_point
                );
            }
            Err(e) => warn!("{} is not a builtin: {e}", self.program),
        }
        println!("first thread starts at {start:#x}");

        loader.shutdown();
        Ok(())
    }
}
