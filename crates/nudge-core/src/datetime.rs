use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;

const TIMEZONE_ENV_VAR: &str =
  "NUDGE_TIMEZONE";

/// The timezone that decides which
/// calendar day a timestamp falls on.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
  tz: Tz
}

impl Default for Calendar {
  fn default() -> Self {
    Self::utc()
  }
}

impl Calendar {
  pub fn new(tz: Tz) -> Self {
    Self {
      tz
    }
  }

  pub fn utc() -> Self {
    Self::new(chrono_tz::UTC)
  }

  /// `$NUDGE_TIMEZONE` wins over the
  /// configured value; anything
  /// unparsable falls back to UTC.
  pub fn resolve(
    configured: Option<&str>
  ) -> Self {
    if let Ok(raw) =
      std::env::var(TIMEZONE_ENV_VAR)
      && let Some(tz) = parse_timezone(
        &raw,
        TIMEZONE_ENV_VAR
      )
    {
      return Self::new(tz);
    }

    if let Some(raw) = configured
      && let Some(tz) =
        parse_timezone(raw, "config")
    {
      return Self::new(tz);
    }

    Self::utc()
  }

  pub fn timezone(&self) -> Tz {
    self.tz
  }

  #[must_use]
  pub fn local_date(
    &self,
    dt: DateTime<Utc>
  ) -> NaiveDate {
    dt.with_timezone(&self.tz)
      .date_naive()
  }

  pub fn same_day(
    &self,
    a: DateTime<Utc>,
    b: DateTime<Utc>
  ) -> bool {
    self.local_date(a)
      == self.local_date(b)
  }

  #[must_use]
  pub fn format(
    &self,
    dt: DateTime<Utc>
  ) -> String {
    dt.with_timezone(&self.tz)
      .format("%Y-%m-%d %H:%M")
      .to_string()
  }

  fn to_utc(
    &self,
    local_naive: NaiveDateTime,
    context: &str
  ) -> anyhow::Result<DateTime<Utc>> {
    match self
      .tz
      .from_local_datetime(&local_naive)
    {
      | LocalResult::Single(local_dt) => {
        Ok(local_dt.with_timezone(&Utc))
      }
      | LocalResult::Ambiguous(
        first,
        second
      ) => {
        tracing::warn!(
          context,
          first = %first,
          second = %second,
          "ambiguous local datetime; using earliest"
        );
        let chosen = if first <= second {
          first
        } else {
          second
        };
        Ok(chosen.with_timezone(&Utc))
      }
      | LocalResult::None => {
        Err(anyhow!(
          "local datetime does not \
           exist in configured \
           timezone: {context}"
        ))
      }
    }
  }

  fn midnight(
    &self,
    date: NaiveDate,
    context: &str
  ) -> anyhow::Result<DateTime<Utc>> {
    let midnight = date
      .and_hms_opt(0, 0, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct \
           midnight for {context}"
        )
      })?;
    self.to_utc(midnight, context)
  }
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "configured calendar timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::warn!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

#[tracing::instrument(skip(now, calendar), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  now: DateTime<Utc>,
  calendar: &Calendar
) -> anyhow::Result<DateTime<Utc>> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();
  let today = calendar.local_date(now);

  match lower.as_str() {
    | "now" => return Ok(now),
    | "today" => {
      return calendar
        .midnight(today, "today");
    }
    | "tomorrow" => {
      let date = today
        .succ_opt()
        .ok_or_else(|| {
          anyhow!("date out of range")
        })?;
      return calendar
        .midnight(date, "tomorrow");
    }
    | "yesterday" => {
      let date = today
        .pred_opt()
        .ok_or_else(|| {
          anyhow!("date out of range")
        })?;
      return calendar
        .midnight(date, "yesterday");
    }
    | _ => {}
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    let target_date = next_weekday_date(
      today,
      target_weekday
    );
    return calendar.midnight(
      target_date,
      "weekday-name"
    );
  }

  if let Some((hour, minute)) =
    parse_clock_time(token)
  {
    let local_now =
      now.with_timezone(&calendar.tz);
    let mut day =
      local_now.date_naive();
    let candidate = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct clock \
           time candidate"
        )
      })?;
    if candidate
      <= local_now.naive_local()
    {
      day = day
        .succ_opt()
        .ok_or_else(|| {
          anyhow!(
            "failed to advance to \
             next day"
          )
        })?;
    }
    let next_candidate = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct next \
           clock time candidate"
        )
      })?;
    return calendar.to_utc(
      next_candidate,
      "clock-time"
    );
  }

  let rel_re = Regex::new(r"^(?P<sign>[+-])(?P<num>\d+)(?P<unit>[dhm])$")
        .map_err(|e| anyhow!("internal regex compile failure: {e}"))?;

  if let Some(caps) =
    rel_re.captures(token)
  {
    let negative = caps
      .name("sign")
      .map(|m| m.as_str() == "-")
      .unwrap_or(false);
    let num: i64 = caps
      .name("num")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!(
          "missing relative amount"
        )
      })?
      .parse()
      .context(
        "invalid relative number"
      )?;

    let duration = match caps
      .name("unit")
      .map(|m| m.as_str())
    {
      | Some("d") => {
        Duration::try_days(num)
      }
      | Some("h") => {
        Duration::try_hours(num)
      }
      | Some("m") => {
        Duration::try_minutes(num)
      }
      | other => {
        return Err(anyhow!(
          "unknown relative unit: \
           {other:?}"
        ));
      }
    }
    .ok_or_else(|| {
      anyhow!(
        "date out of range: {token}"
      )
    })?;

    let shifted = if negative {
      now.checked_sub_signed(duration)
    } else {
      now.checked_add_signed(duration)
    };
    return shifted.ok_or_else(|| {
      anyhow!(
        "date out of range: {token}"
      )
    });
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(dt.with_timezone(&Utc));
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return calendar
      .midnight(date, "date");
  }

  for fmt in
    ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
  {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return calendar.to_utc(ndt, fmt);
    }
  }

  Err(anyhow!(
    "unrecognized date expression: \
     {input}"
  ))
  .with_context(|| {
    "supported formats: \
     now/today/tomorrow/yesterday, \
     weekday names (e.g. monday), \
     clock times (e.g. 3:23pm or \
     15:23), +Nd/+Nh/+Nm, RFC3339, \
     YYYY-MM-DD, YYYY-MM-DDTHH:MM, \
     YYYY-MM-DD HH:MM"
  })
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = from
    .weekday()
    .num_days_from_monday()
    as i64;
  let target_idx = target
    .num_days_from_monday()
    as i64;
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  from
    .checked_add_signed(Duration::days(
      delta
    ))
    .unwrap_or(from)
}

fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let clock_re = Regex::new(
    r"(?i)^(?P<hour>\d{1,2}):(?P<minute>\d{2})\s*(?P<ampm>[ap]m)?$",
  )
  .ok()?;
  let captures =
    clock_re.captures(token.trim())?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = captures
    .name("minute")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  if minute > 59 {
    return None;
  }

  let hour = if let Some(ampm_match) =
    captures.name("ampm")
  {
    if raw_hour == 0 || raw_hour > 12 {
      return None;
    }
    match ampm_match
      .as_str()
      .to_ascii_lowercase()
      .as_str()
    {
      | "am" => raw_hour % 12,
      | "pm" => raw_hour % 12 + 12,
      | _ => return None
    }
  } else {
    if raw_hour > 23 {
      return None;
    }
    raw_hour
  };

  Some((hour, minute))
}


pub mod stamp_serde {
  use chrono::{
    DateTime,
    NaiveDateTime,
    Utc
  };
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  const FORMAT: &str =
    "%Y%m%dT%H%M%S%.fZ";
  const WHOLE_SECONDS: &str =
    "%Y%m%dT%H%M%SZ";

  pub fn serialize<S>(
    dt: &DateTime<Utc>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.serialize_str(
      &dt.format(FORMAT).to_string()
    )
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<DateTime<Utc>, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    NaiveDateTime::parse_from_str(
      &raw, FORMAT
    )
    .or_else(|_| {
      NaiveDateTime::parse_from_str(
        &raw,
        WHOLE_SECONDS
      )
    })
    .map(|ndt| {
      DateTime::<Utc>::from_naive_utc_and_offset(
        ndt, Utc
      )
    })
    .map_err(serde::de::Error::custom)
  }

  pub mod option {
    use chrono::{
      DateTime,
      Utc
    };
    use serde::{
      Deserialize,
      Deserializer,
      Serializer
    };

    pub fn serialize<S>(
      dt: &Option<DateTime<Utc>>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match dt {
        | Some(value) => {
          super::serialize(
            value, serializer
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }

    pub fn deserialize<'de, D>(
      deserializer: D
    ) -> Result<
      Option<DateTime<Utc>>,
      D::Error
    >
    where
      D: Deserializer<'de>
    {
      #[derive(Deserialize)]
      struct Wrapper(
        #[serde(
          deserialize_with = "super::deserialize"
        )]
        DateTime<Utc>
      );

      let opt =
        Option::<Wrapper>::deserialize(
          deserializer
        )?;
      Ok(opt.map(|Wrapper(dt)| dt))
    }
  }

  #[cfg(test)]
  mod tests {
    use chrono::{
      DateTime,
      Duration,
      TimeZone,
      Utc
    };
    use serde::{
      Deserialize,
      Serialize
    };

    #[derive(
      Debug,
      Serialize,
      Deserialize,
      PartialEq
    )]
    struct Stamped {
      #[serde(with = "super")]
      at: DateTime<Utc>
    }

    #[test]
    fn keeps_subsecond_precision() {
      let at = Utc
        .with_ymd_and_hms(
          2026, 3, 2, 8, 30, 0
        )
        .single()
        .expect("valid")
        + Duration::milliseconds(250);
      let json = serde_json::to_string(
        &Stamped { at }
      )
      .expect("serialize");
      assert_eq!(
        json,
        r#"{"at":"20260302T083000.250Z"}"#
      );

      let now = Stamped { at: Utc::now() };
      let back: Stamped =
        serde_json::from_str(
          &serde_json::to_string(&now)
            .expect("serialize")
        )
        .expect("deserialize");
      assert_eq!(back, now);
    }

    #[test]
    fn reads_whole_second_stamps() {
      let back: Stamped =
        serde_json::from_str(
          r#"{"at":"20260302T083000Z"}"#
        )
        .expect("deserialize");
      assert_eq!(
        back.at,
        Utc
          .with_ymd_and_hms(
            2026, 3, 2, 8, 30, 0
          )
          .single()
          .expect("valid")
      );
    }
  }
}
