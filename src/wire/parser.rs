use std::convert::TryFrom;

use super::protocol::{Command, Response};

/// Parses an unsigned decimal integer from a byte slice. Rejects empty
/// input, any non-digit byte (including a leading `+`/`-` sign), and
/// overflow.
fn parse_u64(tok: &[u8]) -> Result<u64, Response> {
    if tok.is_empty() {
        return Err(Response::BadFormat);
    }
    let mut acc: u64 = 0;
    for &b in tok {
        if !b.is_ascii_digit() {
            return Err(Response::BadFormat);
        }
        let digit = (b - b'0') as u64;
        acc = acc
            .checked_mul(10)
            .and_then(|a| a.checked_add(digit))
            .ok_or(Response::BadFormat)?;
    }
    Ok(acc)
}

fn parse_u32(tok: &[u8]) -> Result<u32, Response> {
    let v = parse_u64(tok)?;
    u32::try_from(v).map_err(|_| Response::BadFormat)
}

fn parse_tube(tok: &[u8]) -> Result<Vec<u8>, Response> {
    crate::types::tube::TubeName::parse(tok)
        .map(|t| t.as_bytes().to_vec())
        .ok_or(Response::BadFormat)
}

/// Splits `line` on single ASCII space bytes. A run of multiple spaces
/// produces empty tokens, which callers reject as `BAD_FORMAT` (matching
/// the strict single-space-separated grammar of the wire protocol).
fn words(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|&b| b == b' ')
}

impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        let mut w = words(line);
        let verb = w.next().ok_or(Response::BadFormat)?;

        macro_rules! next {
            () => {
                w.next().ok_or(Response::BadFormat)?
            };
        }
        macro_rules! done {
            () => {
                if w.next().is_some() {
                    return Err(Response::BadFormat);
                }
            };
        }

        Ok(match verb {
            b"put" => {
                let pri = parse_u32(next!())?;
                let delay = parse_u32(next!())?;
                let ttr = parse_u32(next!())?;
                let n_bytes = parse_u32(next!())?;
                done!();
                Command::Put {
                    pri,
                    delay,
                    ttr,
                    n_bytes,
                }
            },
            b"use" => {
                let tube = parse_tube(next!())?;
                done!();
                Command::Use { tube }
            },
            b"reserve" => {
                done!();
                Command::Reserve
            },
            b"reserve-with-timeout" => {
                let timeout = parse_u32(next!())?;
                done!();
                Command::ReserveWithTimeout { timeout }
            },
            b"reserve-job" => {
                let id = parse_u64(next!())?;
                done!();
                Command::ReserveJob { id }
            },
            b"delete" => {
                let id = parse_u64(next!())?;
                done!();
                Command::Delete { id }
            },
            b"release" => {
                let id = parse_u64(next!())?;
                let pri = parse_u32(next!())?;
                let delay = parse_u32(next!())?;
                done!();
                Command::Release { id, pri, delay }
            },
            b"bury" => {
                let id = parse_u64(next!())?;
                let pri = parse_u32(next!())?;
                done!();
                Command::Bury { id, pri }
            },
            b"touch" => {
                let id = parse_u64(next!())?;
                done!();
                Command::Touch { id }
            },
            b"watch" => {
                let tube = parse_tube(next!())?;
                done!();
                Command::Watch { tube }
            },
            b"ignore" => {
                let tube = parse_tube(next!())?;
                done!();
                Command::Ignore { tube }
            },
            b"peek" => {
                let id = parse_u64(next!())?;
                done!();
                Command::Peek { id }
            },
            b"peek-ready" => {
                done!();
                Command::PeekReady
            },
            b"peek-delayed" => {
                done!();
                Command::PeekDelayed
            },
            b"peek-buried" => {
                done!();
                Command::PeekBuried
            },
            b"kick" => {
                let bound = parse_u64(next!())?;
                done!();
                Command::Kick { bound }
            },
            b"kick-job" => {
                let id = parse_u64(next!())?;
                done!();
                Command::KickJob { id }
            },
            b"stats-job" => {
                let id = parse_u64(next!())?;
                done!();
                Command::StatsJob { id }
            },
            b"stats-tube" => {
                let tube = parse_tube(next!())?;
                done!();
                Command::StatsTube { tube }
            },
            b"stats" => {
                done!();
                Command::StatsServer
            },
            b"list-tubes" => {
                done!();
                Command::ListTubes
            },
            b"list-tube-used" => {
                done!();
                Command::ListTubeUsed
            },
            b"list-tubes-watched" => {
                done!();
                Command::ListTubesWatched
            },
            b"quit" => {
                done!();
                Command::Quit
            },
            b"pause-tube" => {
                let tube = parse_tube(next!())?;
                let delay = parse_u32(next!())?;
                done!();
                Command::PauseTube { tube, delay }
            },
            _ => return Err(Response::UnknownCommand),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put() {
        let cmd: Command = b"put 10 0 60 8".as_ref().try_into().unwrap();
        assert_eq!(
            cmd,
            Command::Put {
                pri: 10,
                delay: 0,
                ttr: 60,
                n_bytes: 8
            }
        );
    }

    #[test]
    fn rejects_signed_priority() {
        let err: Response = Command::try_from(b"put -1 0 60 8".as_ref()).unwrap_err();
        assert_eq!(err, Response::BadFormat);
    }

    #[test]
    fn rejects_overflowing_priority() {
        let err =
            Command::try_from(b"put 4294967296 0 60 8".as_ref()).unwrap_err();
        assert_eq!(err, Response::BadFormat);

        let ok = Command::try_from(b"put 4294967295 0 60 8".as_ref()).unwrap();
        assert_eq!(
            ok,
            Command::Put {
                pri: 4294967295,
                delay: 0,
                ttr: 60,
                n_bytes: 8
            }
        );
    }

    #[test]
    fn unknown_verb() {
        assert_eq!(
            Command::try_from(b"nont10knowncommand".as_ref()).unwrap_err(),
            Response::UnknownCommand
        );
    }

    #[test]
    fn missing_field_is_bad_format() {
        assert_eq!(
            Command::try_from(b"put 10 0 60".as_ref()).unwrap_err(),
            Response::BadFormat
        );
    }

    #[test]
    fn trailing_field_is_bad_format() {
        assert_eq!(
            Command::try_from(b"quit extra".as_ref()).unwrap_err(),
            Response::BadFormat
        );
    }

    #[test]
    fn parses_use_and_watch() {
        assert_eq!(
            Command::try_from(b"use foo".as_ref()).unwrap(),
            Command::Use {
                tube: b"foo".to_vec()
            }
        );
        assert_eq!(
            Command::try_from(b"watch bar".as_ref()).unwrap(),
            Command::Watch {
                tube: b"bar".to_vec()
            }
        );
    }
}
