use clap::Args;
use pebridge::loader::Result as LoaderResult;

use super::LoaderOpts;

#[derive(Args)]
pub struct Cmd {
    /// Builtin module name
    pub name: String,

    /// Only resolve this export
    pub symbol: Option<String>,
}

impl Cmd {
    pub fn execute(&self, opts: &LoaderOpts) -> LoaderResult<()> {
        let loader = opts.loader();
        let loaded = loader.load_builtin(&self.name)?;

        match &self.symbol {
            Some(symbol) => match loader.find_export(loaded.module, symbol)? {
                Some(addr) => println!("{symbol} {addr:#x}"),
                None => eprintln!("{}: {symbol} is not exported", self.name),
            },
            None => {
                for export in loader.exports(loaded.module)? {
                    match export.address {
                        Some(addr) => println!("{:>5} {addr:#018x} {}", export.ordinal, export.name),
                        None => println!("{:>5} {:>18} {}", export.ordinal, "-", export.name),
                    }
                }
            }
        }

        loader.shutdown();
        Ok(())
    }
}
