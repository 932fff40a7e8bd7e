//! List the session kinds and how they treat the runtime.

use clap::Args;
use hostscript_runtime::SessionKind;

#[derive(Args)]
pub struct KindsArgs {
    /// Print only the machine names, one per line
    #[arg(short, long)]
    pub quiet: bool,
}

fn describe(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Local => "private handle per session, no process-wide configuration",
        SessionKind::Shared => "handle on the shared runtime, configured once per process",
        SessionKind::Global => "like shared, every use serialized by the global lock",
    }
}

pub fn run(args: &KindsArgs) {
    for kind in SessionKind::ALL {
        if args.quiet {
            println!("{kind}");
        } else {
            println!("{:<8} {:<18} {}", kind.name(), kind.pretty_name(), describe(kind));
        }
    }
}
