//! 관리 대상 컨테이너 이름 판별

use regex::Regex;

use crate::error::SnatGuardError;

/// 기본 이름 패턴: `mc` + 숫자
pub const DEFAULT_NAME_PATTERN: &str = "^mc[0-9]+$";

/// 컨테이너 이름이 관리 대상인지 판별합니다.
///
/// 이벤트 필터링과 prune 후보 필터링이 같은 인스턴스를 공유하므로
/// 한 이름은 어디서나 같은 결과를 얻습니다.
#[derive(Debug, Clone)]
pub struct NameMatcher {
    pattern: Regex,
}

impl NameMatcher {
    /// 정규식 패턴으로 매처를 생성합니다.
    ///
    /// 패턴은 이름 전체에 일치해야 하므로 `^…$` 앵커를 포함하는 것이 일반적입니다.
    pub fn new(pattern: &str) -> Result<Self, SnatGuardError> {
        let pattern = Regex::new(pattern).map_err(|e| SnatGuardError::Config {
            field: "name_pattern".to_owned(),
            reason: format!("invalid regex: {e}"),
        })?;
        Ok(Self { pattern })
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_classification() {
        let matcher = NameMatcher::new(DEFAULT_NAME_PATTERN).unwrap();
        for managed in ["mc1", "mc42", "mc007"] {
            assert!(matcher.is_managed(managed), "{managed} should be managed");
        }
        for unmanaged in ["mc", "web1", "mc12x", "xmc1", "", "MC1"] {
            assert!(!matcher.is_managed(unmanaged), "{unmanaged} should not be managed");
        }
    }

    #[test]
    fn custom_pattern() {
        let matcher = NameMatcher::new("^srv-[a-z]+$").unwrap();
        assert!(matcher.is_managed("srv-alpha"));
        assert!(!matcher.is_managed("mc1"));
        assert_eq!(matcher.as_str(), "^srv-[a-z]+$");
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = NameMatcher::new("mc[").unwrap_err();
        assert!(matches!(err, SnatGuardError::Config { .. }));
    }
}
