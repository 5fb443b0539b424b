use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML file describing the capture, source, sink and checkpoint store.
    #[arg(short, long, default_value = "capture.yaml")]
    pub config: String,

    #[arg(short, long, default_value = "8000")]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["capture-app"]);
        assert_eq!(args.config, "capture.yaml");
        assert_eq!(args.port, 8000);
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from(["capture-app", "--config", "/etc/shop.yaml", "-p", "9000"]);
        assert_eq!(args.config, "/etc/shop.yaml");
        assert_eq!(args.port, 9000);
    }
}
