//! Simulator-style `+name=value` run-time arguments.
//!
//! Simulators pass their own plusargs through, so names this program does not
//! know are dropped instead of rejected. Known ones are rewritten into the
//! matching long flag (`+barrier_uri=x` becomes `--barrier-uri=x`); a bare
//! `+name` becomes `--name`.

use log::debug;

pub fn normalize<I>(args: I, known: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = vec![];
    for (i, arg) in args.into_iter().enumerate() {
        // argv[0] is the program name
        if i == 0 {
            out.push(arg);
            continue;
        }
        let Some(body) = arg.strip_prefix('+') else {
            out.push(arg);
            continue;
        };
        let (name, value) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (body, None),
        };
        let flag = name.replace('_', "-");
        if !known.iter().any(|k| *k == flag) {
            debug!("ignoring plusarg +{}", name);
            continue;
        }
        out.push(match value {
            Some(value) => format!("--{}={}", flag, value),
            None => format!("--{}", flag),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_known_plusargs() {
        let known = args(&["barrier-uri", "barrier-leader", "max-cycles"]);
        let out = normalize(
            args(&[
                "sim",
                "+barrier_uri=/dev/shm/b0",
                "+barrier_leader",
                "--max-cycles",
                "10",
            ]),
            &known,
        );
        assert_eq!(
            out,
            args(&[
                "sim",
                "--barrier-uri=/dev/shm/b0",
                "--barrier-leader",
                "--max-cycles",
                "10"
            ])
        );
    }

    #[test]
    fn test_normalize_drops_unknown_plusargs() {
        let known = args(&["period"]);
        let out = normalize(
            args(&["sim", "+trace", "+verilator+seed+3", "+period=2e-9"]),
            &known,
        );
        assert_eq!(out, args(&["sim", "--period=2e-9"]));
    }

    #[test]
    fn test_value_keeps_equals_signs() {
        let known = args(&["barrier-uri"]);
        let out = normalize(args(&["sim", "+barrier_uri=/tmp/a=b"]), &known);
        assert_eq!(out, args(&["sim", "--barrier-uri=/tmp/a=b"]));
    }
}
