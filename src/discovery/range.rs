use crate::error::DeployError;
use std::net::Ipv4Addr;

/// 单次展开允许的最大地址数
pub const MAX_RANGE_SIZE: u32 = 65_536;

/// 展开地址或地址范围
///
/// 支持 `10.0.0.5`、`10.0.0.1-10.0.0.20` 以及省略前缀的 `10.0.0.1-254`。
/// 两端都包含在结果内。
pub fn parse_range(input: &str) -> Result<Vec<String>, DeployError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DeployError::FormatError("Address range cannot be empty".to_string()));
    }

    let Some((start_str, end_str)) = input.split_once('-') else {
        let addr = parse_addr(input)?;
        return Ok(vec![addr.to_string()]);
    };

    let start = parse_addr(start_str.trim())?;
    let end = parse_range_end(end_str.trim(), &start, input)?;

    let (first, last) = (u32::from(start), u32::from(end));
    if last < first {
        return Err(DeployError::FormatError(format!(
            "Range end {} is before start {} in '{}'",
            end, start, input
        )));
    }
    if last - first >= MAX_RANGE_SIZE {
        return Err(DeployError::FormatError(format!(
            "Range '{}' spans more than {} addresses",
            input, MAX_RANGE_SIZE
        )));
    }

    Ok((first..=last).map(|n| Ipv4Addr::from(n).to_string()).collect())
}

fn parse_addr(s: &str) -> Result<Ipv4Addr, DeployError> {
    let segments = s.split('.').count();
    if segments != 4 {
        return Err(DeployError::FormatError(format!(
            "Invalid address '{}': expected 4 segments, found {}",
            s, segments
        )));
    }
    s.parse::<Ipv4Addr>()
        .map_err(|e| DeployError::FormatError(format!("Invalid address '{}': {}", s, e)))
}

/// 范围结尾可以是完整地址，也可以只写最后一段
fn parse_range_end(end_str: &str, start: &Ipv4Addr, input: &str) -> Result<Ipv4Addr, DeployError> {
    match end_str.split('.').count() {
        4 => parse_addr(end_str),
        1 => {
            let octet = end_str.parse::<u8>().map_err(|e| {
                DeployError::FormatError(format!(
                    "Invalid end octet '{}' in '{}': {}",
                    end_str, input, e
                ))
            })?;
            let mut octets = start.octets();
            octets[3] = octet;
            Ok(Ipv4Addr::from(octets))
        }
        n => Err(DeployError::FormatError(format!(
            "Invalid range end '{}' in '{}': expected a full address or a single octet, found {} segments",
            end_str, input, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_range() {
        assert_eq!(
            parse_range("10.0.0.1-3").unwrap(),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn test_single_address() {
        assert_eq!(parse_range("10.0.0.5").unwrap(), vec!["10.0.0.5"]);
        assert_eq!(parse_range(" 192.168.1.1 ").unwrap(), vec!["192.168.1.1"]);
    }

    #[test]
    fn test_full_range_crosses_octet() {
        let addrs = parse_range("10.0.0.254-10.0.1.1").unwrap();
        assert_eq!(addrs, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn test_full_subnet_with_bare_octet() {
        let addrs = parse_range("10.0.0.1-254").unwrap();
        assert_eq!(addrs.len(), 254);
        assert_eq!(addrs.first().unwrap(), "10.0.0.1");
        assert_eq!(addrs.last().unwrap(), "10.0.0.254");
    }

    #[test]
    fn test_invalid_inputs() {
        for input in [
            "bad-input",
            "",
            "10.0.0",
            "10.0.0.1.5",
            "10.0.0.300",
            "10.0.0.1-300",
            "10.0.0.1-0.5",
            "10.0.0.9-3",
            "10.0.0.1-",
            "1.0.0.0-2.0.0.0",
        ] {
            assert!(
                matches!(parse_range(input), Err(DeployError::FormatError(_))),
                "expected format error for '{}'",
                input
            );
        }
    }
}
