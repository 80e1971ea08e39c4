//! 自动选轨规则
//!
//! 优先级依次为：用户指定的轨道 id、用户指定的序号、语言偏好列表
//! （列表中的 "none" 禁止继续回退）、解复用器声明的默认轨道、格式优先级。

use crate::core::EsId;

/// 某个类别的用户 / 解复用器偏好
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackPrefs<'a> {
    pub requested_id: Option<EsId>,
    pub requested_channel: Option<i32>,
    pub languages: &'a [String],
    pub demux_default: Option<EsId>,
    /// 没有其他偏好时是否按优先级自动选择
    pub autoselect: bool,
}

/// 参与比较的轨道
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate<'a> {
    pub id: EsId,
    pub channel: i32,
    pub language: Option<&'a str>,
    pub priority: i32,
}

/// 语言在偏好列表中的位置；"any" 匹配除 "none" 外的任意语言
pub(crate) fn language_index(list: &[String], language: Option<&str>) -> Option<usize> {
    let language = language?;
    list.iter().position(|pref| {
        pref.eq_ignore_ascii_case(language)
            || (pref.eq_ignore_ascii_case("any") && !language.eq_ignore_ascii_case("none"))
    })
}

/// 判断 es 是否应当取代当前主轨道 main 被选中
pub(crate) fn is_wanted(prefs: &TrackPrefs<'_>, es: &Candidate<'_>, main: Option<&Candidate<'_>>) -> bool {
    if let Some(id) = prefs.requested_id {
        return es.id == id;
    }
    if let Some(channel) = prefs.requested_channel {
        return es.channel == channel;
    }

    let by_priority = prefs.autoselect && main.map_or(true, |m| es.priority > m.priority);

    if prefs.languages.is_empty() {
        if prefs.demux_default == Some(es.id) {
            return true;
        }
        return by_priority;
    }

    let stop = language_index(prefs.languages, Some("none"));
    let current = main.and_then(|m| language_index(prefs.languages, m.language));
    let index = language_index(prefs.languages, es.language);

    match index {
        Some(index) if stop.map_or(true, |stop| stop > index) => match (main, current) {
            (None, _) | (_, None) => true,
            (Some(main), Some(current)) => {
                index < current || (index == current && main.priority < es.priority)
            }
        },
        // 没有匹配的语言：未被 "none" 禁止时才回退
        _ if stop.is_none() && current.is_none() => {
            if prefs.demux_default == Some(es.id) {
                true
            } else {
                by_priority
            }
        }
        _ => false,
    }
}
