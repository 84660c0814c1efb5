use clap::Args;
use log::warn;
use pebridge::loader::{ImageKind, Result as LoaderResult};

use super::LoaderOpts;

#[derive(Args)]
pub struct Cmd {
    /// Builtin module name, e.g. kernel32.dll
    pub name: String,

    /// Do not load the core runtime first
    #[arg(long)]
    pub no_core: bool,
}

impl Cmd {
    pub fn execute(&self, opts: &LoaderOpts) -> LoaderResult<()> {
        let loader = opts.loader();
        if !self.no_core {
            if let Err(e) = loader.load_core_runtime() {
                warn!("core runtime unavailable, native sides cannot bind: {e}");
            }
        }

        let loaded = loader.load_builtin(&self.name)?;
        let kind = match loaded.image.kind {
            ImageKind::Native => "pe",
            ImageKind::Synthesized => "synthesized",
        };
        println!("module:      {}", loaded.module);
        println!("path:        {}", loaded.path.display());
        println!("image:       {kind}");
        println!("machine:     {:#06x}", loaded.image.machine);
        println!("size:        {:#x}", loaded.image.size_of_image);
        println!("entry point: {:#x}", loaded.image.entry_point);
        match loaded.unix_entry {
            Some(entry) => println!("native init: {entry:#x}"),
            None => println!("native init: none"),
        }

        loader.shutdown();
        Ok(())
    }
}
