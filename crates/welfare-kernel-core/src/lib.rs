use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Upper bound on recommendations returned by one evaluation.
pub const MAX_RECOMMENDATIONS: usize = 5;

/// Number of questions in the fixed survey schema.
pub const QUESTION_COUNT: u8 = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid question id {0}: survey questions are numbered 1..=5")]
    InvalidQuestionId(u8),
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QuestionId(pub u8);

impl QuestionId {
    /// Validate a raw question number against the fixed survey domain.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidQuestionId`] for ids outside 1..=5.
    pub fn new(value: u8) -> Result<Self, EngineError> {
        if (1..=QUESTION_COUNT).contains(&value) {
            Ok(Self(value))
        } else {
            Err(EngineError::InvalidQuestionId(value))
        }
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Display for QuestionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One survey response: a single choice (radio) or a selected set (checkbox).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum AnswerValue {
    Single(String),
    Multi(Vec<String>),
}

impl AnswerValue {
    /// Decode a raw collector answer. A value with a leading `[` is treated as
    /// a JSON-encoded array of selected options; when that parse fails the
    /// raw text is kept as-is so evaluation can still proceed.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        if raw.starts_with('[') {
            if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
                return Self::Multi(items);
            }
        }
        Self::Single(raw.to_string())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(text) => text.trim().is_empty(),
            Self::Multi(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    /// Containment matching: true when the phrase appears anywhere in the
    /// textual form of the answer. This is intentionally loose substring
    /// matching, so a short trigger phrase also matches inside a longer
    /// option string; tightening it to exact option equality would change
    /// which rules fire.
    #[must_use]
    pub fn contains_phrase(&self, phrase: &str) -> bool {
        match self {
            Self::Single(text) => text.contains(phrase),
            Self::Multi(items) => items.iter().any(|item| item.contains(phrase)),
        }
    }
}

/// All of one user's survey responses, keyed by question id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnswerSet(BTreeMap<QuestionId, AnswerValue>);

impl AnswerSet {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, question: QuestionId, answer: AnswerValue) {
        self.0.insert(question, answer);
    }

    #[must_use]
    pub fn get(&self, question: QuestionId) -> Option<&AnswerValue> {
        self.0.get(&question)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build an answer set from (question id, raw answer) pairs as persisted
    /// by the collector. Raw values are decoded with [`AnswerValue::from_raw`];
    /// later pairs for the same question replace earlier ones.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidQuestionId`] when a pair references a
    /// question outside the fixed survey domain.
    pub fn from_raw_pairs<'a, I>(pairs: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (u8, &'a str)>,
    {
        let mut answers = Self::new();
        for (question, raw) in pairs {
            answers.insert(QuestionId::new(question)?, AnswerValue::from_raw(raw));
        }
        Ok(answers)
    }
}

/// One welfare-program suggestion. `title` is the deduplication key; lower
/// `priority` sorts first.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Recommendation {
    pub title: String,
    pub description: String,
    pub eligibility: String,
    pub amount: String,
    pub contact: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct RecommendationTemplate {
    pub title: &'static str,
    pub description: &'static str,
    pub eligibility: &'static str,
    pub amount: &'static str,
    pub contact: &'static str,
    pub priority: u8,
}

impl RecommendationTemplate {
    fn instantiate(&self) -> Recommendation {
        Recommendation {
            title: self.title.to_string(),
            description: self.description.to_string(),
            eligibility: self.eligibility.to_string(),
            amount: self.amount.to_string(),
            contact: self.contact.to_string(),
            priority: self.priority,
        }
    }
}

/// Predicate deciding whether a rule fires for one answer. An empty answer
/// never fires a trigger of either kind.
#[derive(Debug, Clone, Copy)]
pub enum Trigger {
    /// Fires when any listed phrase is contained in the answer text.
    ContainsAny(&'static [&'static str]),
    /// Fires when the answer is non-empty and the phrase is absent.
    AnyWithout(&'static str),
}

impl Trigger {
    #[must_use]
    pub fn fires(self, answer: &AnswerValue) -> bool {
        if answer.is_empty() {
            return false;
        }
        match self {
            Self::ContainsAny(phrases) => {
                phrases.iter().any(|phrase| answer.contains_phrase(phrase))
            }
            Self::AnyWithout(phrase) => !answer.contains_phrase(phrase),
        }
    }
}

/// One row of the declarative rule table: which question it reads, when it
/// fires, and the record it produces.
#[derive(Debug, Clone, Copy)]
pub struct SurveyRule {
    pub question: QuestionId,
    pub trigger: Trigger,
    pub template: RecommendationTemplate,
}

/// Age-gated baseline rule, evaluated before any answer-dependent rule.
#[derive(Debug, Clone, Copy)]
pub struct AgeRule {
    pub min_age: i32,
    pub template: RecommendationTemplate,
}

const BASIC_PENSION: RecommendationTemplate = RecommendationTemplate {
    title: "기초연금",
    description: "만 65세 이상 어르신에게 매월 지급되는 연금",
    eligibility: "만 65세 이상, 소득하위 70%",
    amount: "월 최대 334,810원",
    contact: "국민연금공단",
    priority: 1,
};

const LONG_TERM_CARE: RecommendationTemplate = RecommendationTemplate {
    title: "노인장기요양보험",
    description: "거동이 불편한 어르신을 위한 요양서비스",
    eligibility: "만 65세 이상 또는 65세 미만 거동불편자",
    amount: "본인부담금 15-20%",
    contact: "국민건강보험공단",
    priority: 2,
};

const LIVELIHOOD_BENEFIT: RecommendationTemplate = RecommendationTemplate {
    title: "기초생활급여",
    description: "생계, 의료, 주거, 교육급여 지원",
    eligibility: "기준 중위소득 30-50% 이하",
    amount: "급여별 차등 지급",
    contact: "주민센터",
    priority: 1,
};

const DISABILITY_ACTIVITY_SUPPORT: RecommendationTemplate = RecommendationTemplate {
    title: "장애인활동지원서비스",
    description: "장애인의 일상생활 지원을 위한 활동보조 서비스",
    eligibility: "등록장애인 중 활동지원 인정조사 결과",
    amount: "월 최대 1,944,000원",
    contact: "시군구청 장애인복지과",
    priority: 2,
};

const SOLO_ELDERLY_CARE: RecommendationTemplate = RecommendationTemplate {
    title: "독거노인 생활관리사 파견",
    description: "독거어르신을 위한 안전확인 및 생활지원",
    eligibility: "만 65세 이상 독거노인",
    amount: "무료",
    contact: "지역 시니어클럽",
    priority: 3,
};

const MEDICAL_BENEFIT: RecommendationTemplate = RecommendationTemplate {
    title: "의료급여",
    description: "저소득층 의료비 지원",
    eligibility: "의료급여 수급권자",
    amount: "의료비 본인부담금 면제/경감",
    contact: "국민건강보험공단",
    priority: 2,
};

const HOUSING_BENEFIT: RecommendationTemplate = RecommendationTemplate {
    title: "주거급여",
    description: "저소득층 임차료 및 수선유지비 지원",
    eligibility: "기준 중위소득 47% 이하",
    amount: "지역별 기준임대료 내 실제임차료",
    contact: "주민센터",
    priority: 2,
};

/// Baseline rules, in evaluation order.
pub const AGE_RULES: &[AgeRule] = &[
    AgeRule { min_age: 65, template: BASIC_PENSION },
    AgeRule { min_age: 65, template: LONG_TERM_CARE },
];

/// Answer-dependent rules, in evaluation order (question 1 through 4; the two
/// question-4 rows fire independently). Question 5 has no rule yet.
pub const SURVEY_RULES: &[SurveyRule] = &[
    SurveyRule {
        question: QuestionId(1),
        trigger: Trigger::ContainsAny(&["기초생활수급자", "차상위계층"]),
        template: LIVELIHOOD_BENEFIT,
    },
    SurveyRule {
        question: QuestionId(2),
        trigger: Trigger::AnyWithout("해당 없음"),
        template: DISABILITY_ACTIVITY_SUPPORT,
    },
    SurveyRule {
        question: QuestionId(3),
        trigger: Trigger::ContainsAny(&["혼자 거주"]),
        template: SOLO_ELDERLY_CARE,
    },
    SurveyRule {
        question: QuestionId(4),
        trigger: Trigger::ContainsAny(&["의료비 지원"]),
        template: MEDICAL_BENEFIT,
    },
    SurveyRule {
        question: QuestionId(4),
        trigger: Trigger::ContainsAny(&["주거비 지원"]),
        template: HOUSING_BENEFIT,
    },
];

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Radio,
    Checkbox,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct SurveyQuestion {
    pub id: QuestionId,
    pub text: &'static str,
    pub kind: QuestionKind,
    pub options: &'static [&'static str],
}

const SURVEY_QUESTIONS: &[SurveyQuestion] = &[
    SurveyQuestion {
        id: QuestionId(1),
        text: "현재 가계 소득 수준은 어느 정도입니까?",
        kind: QuestionKind::Radio,
        options: &[
            "기초생활수급자",
            "차상위계층",
            "중위소득 50% 이하",
            "중위소득 80% 이하",
            "중위소득 80% 초과",
        ],
    },
    SurveyQuestion {
        id: QuestionId(2),
        text: "거동이 불편하거나 도움이 필요한 부분이 있습니까?",
        kind: QuestionKind::Checkbox,
        options: &["보행 어려움", "시각 장애", "청각 장애", "치매/인지장애", "기타 신체장애", "해당 없음"],
    },
    SurveyQuestion {
        id: QuestionId(3),
        text: "현재 동거하고 있는 가족이 있습니까?",
        kind: QuestionKind::Radio,
        options: &["혼자 거주", "배우자와 거주", "자녀와 거주", "기타 가족과 거주"],
    },
    SurveyQuestion {
        id: QuestionId(4),
        text: "다음 중 가장 필요하다고 생각하는 지원은 무엇입니까?",
        kind: QuestionKind::Checkbox,
        options: &[
            "생계비 지원",
            "의료비 지원",
            "주거비 지원",
            "교통비 지원",
            "식료품 지원",
            "일자리 지원",
            "건강관리 서비스",
        ],
    },
    SurveyQuestion {
        id: QuestionId(5),
        text: "현재 앓고 있는 질병이나 건강상 문제가 있습니까?",
        kind: QuestionKind::Checkbox,
        options: &[
            "고혈압",
            "당뇨병",
            "관절염",
            "심장질환",
            "뇌혈관질환",
            "우울증",
            "기타 만성질환",
            "해당 없음",
        ],
    },
];

/// The fixed survey schema, in presentation order.
#[must_use]
pub fn survey_questions() -> &'static [SurveyQuestion] {
    SURVEY_QUESTIONS
}

/// Derived engine input. Read-only during evaluation; `region` is carried for
/// future regional rules but no current rule reads it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvaluationContext {
    pub age: i32,
    pub region: String,
    pub answers: AnswerSet,
}

/// Engine output plus the ordered trace of rules that fired.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Evaluation {
    pub recommendations: Vec<Recommendation>,
    pub rule_trace: Vec<String>,
}

/// An evaluation packaged for persistence and display.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvaluationReport {
    pub evaluation_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub age: i32,
    pub region: String,
    pub recommendations: Vec<Recommendation>,
    pub rule_trace: Vec<String>,
}

/// Evaluate the fixed rule tables against one user's context.
///
/// Deterministic and side-effect free: baseline age rules first, then the
/// survey rules in table order, then [`rank_and_dedup`]. Never fails for
/// well-formed input; an answer that matches no expected category simply
/// fires no rule.
#[must_use]
pub fn evaluate(context: &EvaluationContext) -> Vec<Recommendation> {
    evaluate_with_trace(context).recommendations
}

/// Like [`evaluate`], but also reports which rules fired and how the final
/// ordering was produced.
#[must_use]
pub fn evaluate_with_trace(context: &EvaluationContext) -> Evaluation {
    let mut fired: Vec<Recommendation> = Vec::new();
    let mut trace: Vec<String> = Vec::new();

    for rule in AGE_RULES {
        if context.age >= rule.min_age {
            trace.push(format!(
                "baseline: age {} >= {} adds {} (priority {})",
                context.age, rule.min_age, rule.template.title, rule.template.priority
            ));
            fired.push(rule.template.instantiate());
        }
    }

    for rule in SURVEY_RULES {
        let Some(answer) = context.answers.get(rule.question) else {
            continue;
        };
        if rule.trigger.fires(answer) {
            trace.push(format!(
                "q{}: adds {} (priority {})",
                rule.question, rule.template.title, rule.template.priority
            ));
            fired.push(rule.template.instantiate());
        }
    }

    trace.push("sort: stable by ascending priority".to_string());
    trace.push("dedup: keep first occurrence per title".to_string());
    trace.push(format!("truncate: at most {MAX_RECOMMENDATIONS} records"));

    Evaluation { recommendations: rank_and_dedup(fired), rule_trace: trace }
}

/// Build a persistable report for one evaluation run.
///
/// # Errors
/// Returns [`EngineError::Evaluation`] when `evaluation_id` is empty.
pub fn build_evaluation_report(
    context: &EvaluationContext,
    evaluation_id: &str,
    generated_at: OffsetDateTime,
) -> Result<EvaluationReport, EngineError> {
    if evaluation_id.trim().is_empty() {
        return Err(EngineError::Evaluation(
            "evaluation_id MUST be provided for stored reports".to_string(),
        ));
    }

    let evaluation = evaluate_with_trace(context);
    Ok(EvaluationReport {
        evaluation_id: evaluation_id.to_string(),
        generated_at,
        age: context.age,
        region: context.region.clone(),
        recommendations: evaluation.recommendations,
        rule_trace: evaluation.rule_trace,
    })
}

/// The named two-step ranking: stable sort by ascending priority (ties keep
/// evaluation order), then first-occurrence dedup by title, then cap at
/// [`MAX_RECOMMENDATIONS`].
fn rank_and_dedup(mut fired: Vec<Recommendation>) -> Vec<Recommendation> {
    fired.sort_by_key(|record| record.priority);

    let mut seen_titles: BTreeSet<String> = BTreeSet::new();
    let mut unique: Vec<Recommendation> = Vec::new();
    for record in fired {
        if seen_titles.insert(record.title.clone()) {
            unique.push(record);
        }
    }

    unique.truncate(MAX_RECOMMENDATIONS);
    unique
}
