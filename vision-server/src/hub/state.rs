use serde::Serialize;
use thiserror::Error;

/// 连接生命周期状态
///
/// 合法转换：
/// - Connecting -> Streaming（握手完成）
/// - Connecting -> Closing（握手失败）
/// - Streaming -> Closing
/// - Closing -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid hub state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: HubState,
    pub to: HubState,
}

impl HubState {
    pub fn can_transition_to(self, next: HubState) -> bool {
        matches!(
            (self, next),
            (HubState::Connecting, HubState::Streaming)
                | (HubState::Connecting, HubState::Closing)
                | (HubState::Streaming, HubState::Closing)
                | (HubState::Closing, HubState::Closed)
        )
    }

    pub fn transition(self, next: HubState) -> Result<HubState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }

    /// 是否已进入关闭流程
    pub fn is_terminating(self) -> bool {
        matches!(self, HubState::Closing | HubState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HubState; 4] = [
        HubState::Connecting,
        HubState::Streaming,
        HubState::Closing,
        HubState::Closed,
    ];

    #[test]
    fn test_legal_transitions() {
        let legal = [
            (HubState::Connecting, HubState::Streaming),
            (HubState::Connecting, HubState::Closing),
            (HubState::Streaming, HubState::Closing),
            (HubState::Closing, HubState::Closed),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.transition(to).is_ok(),
                    legal.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        for to in ALL {
            assert!(HubState::Closed.transition(to).is_err());
        }
        assert!(HubState::Closed.is_terminating());
        assert!(!HubState::Streaming.is_terminating());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = HubState::Streaming.transition(HubState::Connecting).unwrap_err();
        assert_eq!(err.from, HubState::Streaming);
        assert!(err.to_string().contains("Streaming -> Connecting"));
    }
}
