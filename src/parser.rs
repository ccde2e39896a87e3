use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{opt, recognize},
    sequence::{delimited, preceded, tuple},
    IResult,
};

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Post { message: String, lat: String, lon: String, image: String, user: Option<String> },
    Search { lat: String, lon: String, range: Option<String> },
    Help,
    Exit,
}

// --- BASIC PARSERS ---

/// A decimal number, kept in the textual form it was typed in.
fn parse_number(input: &str) -> IResult<&str, String> {
    let (input, num) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(tuple((char('.'), digit1))),
    )))(input)?;
    Ok((input, num.to_string()))
}

fn parse_quoted(quote: char) -> impl FnMut(&str) -> IResult<&str, String> {
    move |input| {
        let (input, _) = char(quote)(input)?;
        let end = if quote == '"' { "\"" } else { "'" };
        let (input, content) = take_until(end)(input)?;
        let (input, _) = char(quote)(input)?;
        Ok((input, content.to_string()))
    }
}

fn parse_coords(input: &str) -> IResult<&str, (String, String)> {
    let (input, lat) = parse_number(input)?;
    let (input, _) = ws(char(','))(input)?;
    let (input, lon) = parse_number(input)?;
    Ok((input, (lat, lon)))
}

fn parse_user(input: &str) -> IResult<&str, String> {
    let (input, user) = take_while1(|c: char| c.is_alphanumeric() || "_-.@".contains(c))(input)?;
    Ok((input, user.to_string()))
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

// --- COMMAND PARSERS ---

fn parse_post(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("POST")(input)?;
    let (input, message) = ws(parse_quoted('"'))(input)?;
    let (input, _) = ws(tag_ci("AT"))(input)?;
    let (input, (lat, lon)) = parse_coords(input)?;
    let (input, _) = ws(tag_ci("WITH"))(input)?;
    let (input, image) = alt((parse_quoted('\''), parse_quoted('"')))(input)?;

    let (input, user) = opt(preceded(
        tuple((multispace1, tag_ci("AS"), multispace1)),
        parse_user,
    ))(input)?;

    Ok((input, Command::Post { message, lat, lon, image, user }))
}

fn parse_search(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("SEARCH"), tag_ci("FIND")))(input)?;
    let (input, _) = ws(tag_ci("NEAR"))(input)?;
    let (input, (lat, lon)) = parse_coords(input)?;

    let (input, range) = opt(preceded(ws(tag_ci("WITHIN")), parse_number))(input)?;
    let (input, _) = opt(ws(tag_ci("KM")))(input)?;

    Ok((input, Command::Search { lat, lon, range }))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HELP")(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_post,
        parse_search,
        parse_help,
        parse_exit,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context = if e.input.len() > 20 {
                format!("{}...", e.input.chars().take(20).collect::<String>())
            } else {
                e.input.to_string()
            };
            Err(format!("Invalid syntax near: '{}'", context))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}
